//! Parsing of external `.cue` sheets describing track boundaries within a
//! single lossless album file.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_until},
    character::complete::{digit1, line_ending, space1},
    combinator::{map_res, opt},
    multi::many0,
    sequence::{preceded, terminated, tuple},
    IResult,
};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CueError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CUE parsing error: {0}")]
    Parsing(String),
}

/// A single `TRACK` entry in a CUE sheet.
#[derive(Debug, Clone, PartialEq)]
pub struct CueTrack {
    pub number: u32,
    pub title: String,
    pub performer: Option<String>,
    pub start_time_ms: u64,
    /// `None` for the final track; resolved to the source file's total
    /// duration by the SplitTrack driver, which is the only place that
    /// knows the file's actual length.
    pub end_time_ms: Option<u64>,
}

/// A fully-parsed CUE sheet.
#[derive(Debug, Clone, PartialEq)]
pub struct CueSheet {
    pub title: String,
    pub performer: String,
    pub tracks: Vec<CueTrack>,
}

/// Parse a CUE sheet from disk.
pub fn parse_cue_file(cue_path: &Path) -> Result<CueSheet, CueError> {
    let content = std::fs::read_to_string(cue_path)?;
    parse_cue_str(&content)
}

/// Parse CUE sheet content already read into memory.
pub fn parse_cue_str(input: &str) -> Result<CueSheet, CueError> {
    match parse_cue_content(input) {
        Ok((_, sheet)) => Ok(sheet),
        Err(e) => Err(CueError::Parsing(format!("failed to parse CUE sheet: {e}"))),
    }
}

fn parse_cue_content(input: &str) -> IResult<&str, CueSheet> {
    let (input, _) = many0(alt((line_ending, space1, parse_comment_line, parse_file_line)))(input)?;

    let (input, (title, performer)) = alt((
        |i| {
            let (i, performer) = parse_performer(i)?;
            let (i, title) = parse_title(i)?;
            Ok((i, (title, performer)))
        },
        |i| {
            let (i, title) = parse_title(i)?;
            let (i, performer) = parse_performer(i)?;
            Ok((i, (title, performer)))
        },
    ))(input)?;

    let (input, _) = many0(alt((line_ending, space1, parse_file_line, parse_comment_line)))(input)?;

    let (input, mut tracks) = parse_tracks(input)?;

    for i in 0..tracks.len() {
        if i + 1 < tracks.len() {
            tracks[i].end_time_ms = Some(tracks[i + 1].start_time_ms);
        }
    }

    Ok((
        input,
        CueSheet {
            title,
            performer,
            tracks,
        },
    ))
}

fn parse_comment_line(input: &str) -> IResult<&str, &str> {
    let (input, _) = tag("REM")(input)?;
    let (input, _) = take_until("\n")(input)?;
    let (input, _) = line_ending(input)?;
    Ok((input, ""))
}

fn parse_file_line(input: &str) -> IResult<&str, &str> {
    let (input, _) = tag("FILE")(input)?;
    let (input, _) = take_until("\n")(input)?;
    let (input, _) = line_ending(input)?;
    Ok((input, ""))
}

/// `INDEX 00` marks pre-gap silence and is optional; we skip it rather than
/// modeling pre-gaps as a separate concept.
fn parse_index_00_line(input: &str) -> IResult<&str, &str> {
    let (input, _) = many0(alt((line_ending, space1, parse_comment_line)))(input)?;
    let (input, _) = tag("INDEX")(input)?;
    let (input, _) = space1(input)?;
    let (input, _) = tag("00")(input)?;
    let (input, _) = space1(input)?;
    let (input, _) = parse_time(input)?;
    let (input, _) = opt(line_ending)(input)?;
    Ok((input, ""))
}

fn parse_title(input: &str) -> IResult<&str, String> {
    let (input, _) = many0(alt((line_ending, space1, parse_comment_line)))(input)?;
    let (input, _) = tag("TITLE")(input)?;
    let (input, _) = space1(input)?;
    let (input, title) = parse_quoted_string(input)?;
    let (input, _) = opt(line_ending)(input)?;
    Ok((input, title))
}

fn parse_performer(input: &str) -> IResult<&str, String> {
    let (input, _) = many0(alt((line_ending, space1, parse_comment_line)))(input)?;
    let (input, _) = tag("PERFORMER")(input)?;
    let (input, _) = space1(input)?;
    let (input, performer) = parse_quoted_string(input)?;
    let (input, _) = opt(line_ending)(input)?;
    Ok((input, performer))
}

fn parse_tracks(input: &str) -> IResult<&str, Vec<CueTrack>> {
    many0(parse_track)(input)
}

fn parse_track(input: &str) -> IResult<&str, CueTrack> {
    let (input, _) = many0(alt((line_ending, space1, parse_comment_line)))(input)?;
    let (input, _) = tag("TRACK")(input)?;
    let (input, _) = space1(input)?;
    let (input, number) = map_res(digit1, |s: &str| s.parse::<u32>())(input)?;
    let (input, _) = space1(input)?;
    let (input, _) = tag("AUDIO")(input)?;
    let (input, _) = opt(line_ending)(input)?;

    let (input, _) = many0(space1)(input)?;
    let (input, _) = tag("TITLE")(input)?;
    let (input, _) = space1(input)?;
    let (input, title) = parse_quoted_string(input)?;
    let (input, _) = opt(line_ending)(input)?;

    let (input, performer) = opt(preceded(
        tuple((many0(space1), tag("PERFORMER"), space1)),
        terminated(parse_quoted_string, opt(line_ending)),
    ))(input)?;

    let (input, _) = many0(parse_index_00_line)(input)?;
    let (input, _) = many0(alt((line_ending, space1, parse_comment_line)))(input)?;

    let (input, _) = tag("INDEX")(input)?;
    let (input, _) = space1(input)?;
    let (input, _) = tag("01")(input)?;
    let (input, _) = space1(input)?;
    let (input, start_time_ms) = parse_time(input)?;
    let (input, _) = opt(line_ending)(input)?;

    Ok((
        input,
        CueTrack {
            number,
            title,
            performer,
            start_time_ms,
            end_time_ms: None,
        },
    ))
}

fn parse_quoted_string(input: &str) -> IResult<&str, String> {
    let (input, _) = tag("\"")(input)?;
    let (input, content) = take_until("\"")(input)?;
    let (input, _) = tag("\"")(input)?;
    Ok((input, content.to_string()))
}

/// Parse `MM:SS:FF` (75 frames/second CD-audio time) into milliseconds.
fn parse_time(input: &str) -> IResult<&str, u64> {
    let (input, minutes) = map_res(digit1, |s: &str| s.parse::<u64>())(input)?;
    let (input, _) = tag(":")(input)?;
    let (input, seconds) = map_res(digit1, |s: &str| s.parse::<u64>())(input)?;
    let (input, _) = tag(":")(input)?;
    let (input, frames) = map_res(digit1, |s: &str| s.parse::<u64>())(input)?;

    let total_ms = (minutes * 60 * 1000) + (seconds * 1000) + (frames * 1000 / 75);
    Ok((input, total_ms))
}
