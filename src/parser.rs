// https://github.com/Geal/nom/blob/master/doc/choosing_a_combinator.md

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, multispace0},
    combinator::{eof, map, opt},
    multi::{many0, separated_list1},
    sequence::{delimited, preceded, terminated},
    IResult,
};
use thiserror::Error;

#[derive(Debug, PartialEq, Error)]
pub enum ParseError {
    #[error("syntax error near unexpected token `{0}'")]
    Unexpected(char),
    #[error("unterminated quote {0}")]
    Unterminated(char),
    #[error("syntax error near unexpected token `|'")]
    EmptyStage,
    #[error("syntax error near unexpected token `&'")]
    StrayBackground,
    #[error("missing command before redirection")]
    MissingCommand,
}

/// One command of a pipeline.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Stage<'a> {
    pub(crate) argv: Vec<&'a str>,
    pub(crate) input: Option<&'a str>,
    pub(crate) output: Option<&'a str>,
    pub(crate) append: bool,
    pub(crate) error: Option<&'a str>,
}

impl Stage<'_> {
    fn has_redirection(&self) -> bool {
        self.input.is_some() || self.output.is_some() || self.error.is_some()
    }
}

#[derive(Debug, PartialEq)]
pub(crate) struct Pipeline<'a> {
    pub(crate) stages: Vec<Stage<'a>>,
    pub(crate) background: bool,
}

impl Pipeline<'_> {
    /// A blank line: nothing to run.
    pub(crate) fn is_empty(&self) -> bool {
        self.stages.iter().all(|stage| stage.argv.is_empty())
    }
}

enum Item<'a> {
    Word(&'a str),
    Input(&'a str),
    Output(&'a str, bool),
    Error(&'a str),
}

pub(crate) fn parse(input: &str) -> Result<Pipeline<'_>, ParseError> {
    let pipeline = match parse_pipeline(input) {
        Ok((_, pipeline)) => pipeline,
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            return Err(match e.input.chars().next() {
                Some(quote @ ('\'' | '"')) => ParseError::Unterminated(quote),
                Some(c) => ParseError::Unexpected(c),
                None => ParseError::Unexpected('\n'),
            })
        }
        Err(nom::Err::Incomplete(_)) => return Err(ParseError::Unexpected('\n')),
    };

    if pipeline.stages.len() > 1 && pipeline.stages.iter().any(|s| s.argv.is_empty()) {
        return Err(ParseError::EmptyStage);
    }
    if pipeline.stages.iter().any(|s| s.argv.is_empty() && s.has_redirection()) {
        return Err(ParseError::MissingCommand);
    }
    if pipeline.background && pipeline.is_empty() {
        return Err(ParseError::StrayBackground);
    }

    Ok(pipeline)
}

fn parse_pipeline(input: &str) -> IResult<&str, Pipeline<'_>> {
    let (i, stages) = separated_list1(char('|'), parse_stage)(input)?;
    let (i, background) = opt(terminated(char('&'), multispace0))(i)?;
    let (i, _) = eof(i)?;

    Ok((
        i,
        Pipeline {
            stages,
            background: background.is_some(),
        },
    ))
}

fn parse_stage(input: &str) -> IResult<&str, Stage<'_>> {
    let (i, _) = multispace0(input)?; // ignore all leading space
    let (i, items) = many0(terminated(parse_item, multispace0))(i)?;

    let mut stage = Stage::default();
    for item in items {
        match item {
            Item::Word(word) => stage.argv.push(word),
            Item::Input(path) => stage.input = Some(path),
            Item::Output(path, append) => {
                stage.output = Some(path);
                stage.append = append;
            }
            Item::Error(path) => stage.error = Some(path),
        }
    }

    Ok((i, stage))
}

fn parse_item(input: &str) -> IResult<&str, Item<'_>> {
    alt((parse_redirection, map(parse_word, Item::Word)))(input)
}

fn parse_redirection(input: &str) -> IResult<&str, Item<'_>> {
    alt((
        map(preceded(tag("2>"), preceded(multispace0, parse_word)), Item::Error),
        map(preceded(tag(">>"), preceded(multispace0, parse_word)), |w| {
            Item::Output(w, true)
        }),
        map(preceded(char('>'), preceded(multispace0, parse_word)), |w| {
            Item::Output(w, false)
        }),
        map(preceded(char('<'), preceded(multispace0, parse_word)), Item::Input),
    ))(input)
}

fn is_word_char(chr: char) -> bool {
    !chr.is_whitespace() && !matches!(chr, '|' | '<' | '>' | '&' | '\'' | '"')
}

fn parse_word(input: &str) -> IResult<&str, &str> {
    let quoted_word = alt((
        delimited(char('"'), take_while(|c: char| c != '"'), char('"')),
        delimited(char('\''), take_while(|c: char| c != '\''), char('\'')),
    ));

    alt((quoted_word, take_while1(is_word_char)))(input)
}
