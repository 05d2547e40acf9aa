// Copyright 2022 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Bulk import of compact game logs ("CPGN") into an experience file.
//!
//! A compact game log carries one game per line:
//!
//! ```text
//! {fen, result, m1[:score[:depth]], m2[:score[:depth]], …}
//! ```
//!
//! where `result` is `w`, `b`, or `d`, moves are long-algebraic, and the
//! optional score and depth are the engine's evaluation of the move when it
//! was played. Only moves carrying both a score and a depth inside the
//! configured windows become experience entries.
//!
//! The importer does not take the declared result at face value. It replays
//! every game and derives a *believed* result from the recorded scores:
//! mate-range scores decide the game outright, large sustained advantages
//! accumulate confidence for one side, and level scores (or a draw by
//! position on the board) accumulate confidence in a draw. A game whose
//! declared result the scores do not corroborate contributes nothing.
//!
//! Accepted games are appended to the target file through a large write
//! buffer; once the input is exhausted the target is defragmented so every
//! `(key, move)` pair appears exactly once.

use std::{
    fs::{File, OpenOptions},
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use chess::Color;
use thiserror::Error;

use crate::{
    entry::{ExperienceEntry, MIN_DEPTH},
    format::{self, SIGNATURE_V2, WRITE_CHUNK},
    game::{self, Game, GameError},
    store::{self, StoreError},
    values::{is_decisive, GOOD_SCORE, OK_SCORE, VALUE_TB_WIN_IN_MAX_PLY},
};

/// Weight a decisive-bucket score adds to the favored side.
const DECISIVE_PUSH: i32 = 8;
/// Weight a good-bucket score adds to the favored side.
const GOOD_PUSH: i32 = 4;
/// Scores within this margin of level push toward a draw.
const LEVEL_MARGIN: i32 = 50;
/// Confidence required to believe a declared win.
const WIN_THRESHOLD: i32 = 16;
/// Confidence required to believe a declared draw.
const DRAW_THRESHOLD: i32 = 8;
/// Games shorter than this many plies are not worth learning from.
const MIN_PLIES: usize = 16;

/// Filters applied to individual move annotations.
#[derive(Copy, Clone, Debug)]
pub struct ImportOptions {
    pub min_depth: i32,
    pub max_depth: i32,
    pub max_value: i32,
}

impl Default for ImportOptions {
    fn default() -> ImportOptions {
        ImportOptions {
            min_depth: MIN_DEPTH,
            max_depth: 64,
            max_value: VALUE_TB_WIN_IN_MAX_PLY - 1,
        }
    }
}

/// Why a well-formed game was not imported.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Fewer than the minimum number of plies.
    TooShort,
    /// The scores (or a mate-range score) contradict the declared result.
    ResultMismatch,
    /// The scores never built enough confidence in the declared result.
    LowConfidence,
}

/// Ways a game line can be malformed.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CpgnError {
    #[error("line is not enclosed in braces")]
    NotBraced,
    #[error("missing FEN field")]
    MissingFen,
    #[error("missing result field")]
    MissingResult,
    #[error("unknown result code: {0}")]
    UnknownResult(String),
    #[error("bad move annotation: {0}")]
    BadAnnotation(String),
    #[error(transparent)]
    Game(#[from] GameError),
}

/// Errors that stop an import outright. Per-game problems never do; they
/// are tallied and skipped.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Running totals of an import.
#[derive(Clone, Debug, Default)]
pub struct ImportSummary {
    /// Games accepted and written.
    pub games: usize,
    /// Games rejected as malformed.
    pub errors: usize,
    /// Games rejected by result verification.
    pub ignored: usize,
    pub white_wins: usize,
    pub black_wins: usize,
    pub draws: usize,
    /// Annotated moves written as entries.
    pub moves_staged: usize,
    /// Annotated moves filtered by the depth/value windows.
    pub moves_filtered: usize,
    /// Entry bytes written so far (excluding the signature).
    pub bytes_written: u64,
}

/// A progress snapshot handed to the caller's callback.
#[derive(Clone, Debug)]
pub struct ImportProgress<'a> {
    /// Percentage of the input consumed.
    pub percent: f64,
    pub summary: &'a ImportSummary,
}

/// The declared (and believed) result of a game.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GameResult {
    WhiteWin,
    BlackWin,
    Draw,
}

impl GameResult {
    fn parse(code: &str) -> Option<GameResult> {
        match code {
            "w" => Some(GameResult::WhiteWin),
            "b" => Some(GameResult::BlackWin),
            "d" => Some(GameResult::Draw),
            _ => None,
        }
    }

    fn winner(self) -> Option<Color> {
        match self {
            GameResult::WhiteWin => Some(Color::White),
            GameResult::BlackWin => Some(Color::Black),
            GameResult::Draw => None,
        }
    }
}

/// What became of one input line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum LineVerdict {
    Accepted {
        result: GameResult,
        entries: Vec<ExperienceEntry>,
        filtered: usize,
    },
    Ignored(IgnoreReason),
}

/// Imports a compact game log at `src` into the experience file at `dst`,
/// reporting progress through `progress`. The target is defragmented after
/// the last line.
pub fn import_cpgn<F>(
    src: impl AsRef<Path>,
    dst: impl AsRef<Path>,
    options: &ImportOptions,
    mut progress: F,
) -> Result<ImportSummary, ImportError>
where
    F: FnMut(&ImportProgress<'_>),
{
    let src = src.as_ref();
    let dst = dst.as_ref();
    let input = File::open(src).map_err(|e| io_error(src, e))?;
    let input_len = input.metadata().map_err(|e| io_error(src, e))?.len();
    let reader = BufReader::new(input);

    let output = OpenOptions::new()
        .append(true)
        .create(true)
        .open(dst)
        .map_err(|e| io_error(dst, e))?;
    let output_len = output.metadata().map_err(|e| io_error(dst, e))?.len();
    let mut out = BufWriter::with_capacity(WRITE_CHUNK, output);
    let mut signature_pending = output_len == 0;

    let mut summary = ImportSummary::default();
    let mut consumed = 0u64;
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| io_error(src, e))?;
        consumed += line.len() as u64 + 1;
        if line.trim().is_empty() {
            continue;
        }
        match process_line(&line, options) {
            Ok(LineVerdict::Accepted {
                result,
                entries,
                filtered,
            }) => {
                if signature_pending {
                    out.write_all(SIGNATURE_V2).map_err(|e| io_error(dst, e))?;
                    signature_pending = false;
                }
                summary.games += 1;
                summary.moves_filtered += filtered;
                match result {
                    GameResult::WhiteWin => summary.white_wins += 1,
                    GameResult::BlackWin => summary.black_wins += 1,
                    GameResult::Draw => summary.draws += 1,
                }
                for entry in &entries {
                    out.write_all(&format::encode(entry))
                        .map_err(|e| io_error(dst, e))?;
                    summary.bytes_written += format::ENTRY_SIZE as u64;
                }
                summary.moves_staged += entries.len();
            }
            Ok(LineVerdict::Ignored(reason)) => {
                tracing::debug!(line = lineno + 1, ?reason, "game ignored");
                summary.ignored += 1;
            }
            Err(err) => {
                tracing::debug!(line = lineno + 1, %err, "game rejected");
                summary.errors += 1;
            }
        }
        if (lineno + 1) % 1000 == 0 {
            progress(&ImportProgress {
                percent: percent_of(consumed, input_len),
                summary: &summary,
            });
        }
    }
    out.flush().map_err(|e| io_error(dst, e))?;
    drop(out);

    if !signature_pending {
        store::defrag(dst)?;
    }
    progress(&ImportProgress {
        percent: 100.0,
        summary: &summary,
    });
    Ok(summary)
}

fn percent_of(consumed: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        consumed as f64 * 100.0 / total as f64
    }
}

fn io_error(path: &Path, source: io::Error) -> ImportError {
    ImportError::Io {
        path: path.to_owned(),
        source,
    }
}

/// Parses and verifies one game line.
pub(crate) fn process_line(
    line: &str,
    options: &ImportOptions,
) -> Result<LineVerdict, CpgnError> {
    let line = line.trim();
    let inner = line
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .ok_or(CpgnError::NotBraced)?;
    let mut fields = inner.split(',').map(str::trim);
    let fen = fields.next().filter(|f| !f.is_empty()).ok_or(CpgnError::MissingFen)?;
    let result_code = fields.next().ok_or(CpgnError::MissingResult)?;
    let declared = GameResult::parse(result_code)
        .ok_or_else(|| CpgnError::UnknownResult(result_code.to_string()))?;

    let mut game = Game::from_fen(fen)?;
    let mut verdict = ResultDetector::new();
    let mut entries = Vec::new();
    let mut filtered = 0;
    let mut plies = 0;
    let min_depth = options.min_depth.max(MIN_DEPTH);

    for token in fields {
        let mut parts = token.split(':');
        let lan = parts
            .next()
            .unwrap_or("")
            .trim_end_matches(|c| matches!(c, '+' | '#' | '\r' | '\n'));
        let mv = game.resolve_move(lan)?;
        let score = parse_annotation(parts.next(), token)?;
        let depth = parse_annotation(parts.next(), token)?;

        if let Some(score) = score {
            verdict.observe_score(game.side_to_move(), score);
        }
        if let (Some(score), Some(depth)) = (score, depth) {
            if depth >= min_depth && depth <= options.max_depth && score.abs() <= options.max_value
            {
                entries.push(ExperienceEntry::new(
                    game.key(),
                    game::encode_move(mv),
                    score,
                    depth,
                ));
            } else {
                filtered += 1;
            }
        }
        game.do_move(mv);
        if game.is_draw() {
            verdict.observe_position_draw();
        }
        plies += 1;
    }

    if plies < MIN_PLIES {
        return Ok(LineVerdict::Ignored(IgnoreReason::TooShort));
    }
    match verdict.corroborates(declared) {
        Ok(()) => Ok(LineVerdict::Accepted {
            result: declared,
            entries,
            filtered,
        }),
        Err(reason) => Ok(LineVerdict::Ignored(reason)),
    }
}

fn parse_annotation(part: Option<&str>, token: &str) -> Result<Option<i32>, CpgnError> {
    match part {
        None => Ok(None),
        Some(text) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| CpgnError::BadAnnotation(token.trim().to_string())),
    }
}

/// Accumulates belief about a game's true result from its scores.
struct ResultDetector {
    weights: [i32; 2],
    draw_weight: i32,
    draw_flag: bool,
    decided: Option<Color>,
    contradiction: bool,
}

impl ResultDetector {
    fn new() -> ResultDetector {
        ResultDetector {
            weights: [0; 2],
            draw_weight: 0,
            draw_flag: false,
            decided: None,
            contradiction: false,
        }
    }

    /// Feeds one recorded score, from the mover's perspective.
    fn observe_score(&mut self, mover: Color, score: i32) {
        if is_decisive(score) {
            let winner = if score > 0 { mover } else { !mover };
            match self.decided {
                Some(prior) if prior != winner => self.contradiction = true,
                _ => self.decided = Some(winner),
            }
            return;
        }
        let magnitude = score.abs();
        if magnitude >= GOOD_SCORE {
            let favored = if score > 0 { mover } else { !mover };
            self.weights[favored.to_index()] += DECISIVE_PUSH;
            self.weights[(!favored).to_index()] = 0;
        } else if magnitude >= OK_SCORE {
            let favored = if score > 0 { mover } else { !mover };
            self.weights[favored.to_index()] += GOOD_PUSH;
            self.weights[(!favored).to_index()] /= 2;
        } else if magnitude <= LEVEL_MARGIN {
            self.draw_weight += 2;
        } else {
            self.draw_weight += 1;
        }
    }

    fn observe_position_draw(&mut self) {
        self.draw_flag = true;
    }

    /// Checks the declared result against what the scores told us. A
    /// decisive score names the winner but never lowers the confidence
    /// bar: a declared win is accepted only with winner weight at the
    /// threshold, a declared draw only with draw weight or the draw flag.
    fn corroborates(&self, declared: GameResult) -> Result<(), IgnoreReason> {
        if self.contradiction {
            return Err(IgnoreReason::ResultMismatch);
        }
        match declared.winner() {
            Some(winner) => {
                if self.decided.map_or(false, |decided| decided != winner) {
                    return Err(IgnoreReason::ResultMismatch);
                }
                if self.weights[winner.to_index()] >= WIN_THRESHOLD {
                    Ok(())
                } else {
                    Err(IgnoreReason::LowConfidence)
                }
            }
            None => {
                if self.decided.is_some() {
                    return Err(IgnoreReason::ResultMismatch);
                }
                if self.draw_weight >= DRAW_THRESHOLD || self.draw_flag {
                    Ok(())
                } else {
                    Err(IgnoreReason::LowConfidence)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STARTPOS: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

    /// A 16-ply knight shuffle, annotated by `annotate(ply, white_to_move)`.
    fn shuffle_line(result: &str, annotate: impl Fn(usize, bool) -> String) -> String {
        let cycle = ["g1f3", "b8c6", "f3g1", "c6b8"];
        let mut line = format!("{{{}, {}", STARTPOS, result);
        for ply in 0..16 {
            let lan = cycle[ply % 4];
            line.push_str(", ");
            line.push_str(lan);
            line.push_str(&annotate(ply, ply % 2 == 0));
        }
        line.push('}');
        line
    }

    #[test]
    fn accepts_corroborated_white_win() {
        let line = shuffle_line("w", |_, white| {
            if white {
                ":700:10".to_string()
            } else {
                ":-650:10".to_string()
            }
        });
        let verdict = process_line(&line, &ImportOptions::default()).unwrap();
        match verdict {
            LineVerdict::Accepted {
                result, entries, ..
            } => {
                assert_eq!(result, GameResult::WhiteWin);
                assert_eq!(entries.len(), 16);
                assert!(entries.iter().all(|e| e.count == 1));
            }
            other => panic!("expected acceptance, got {:?}", other),
        }
    }

    #[test]
    fn accepts_level_draw() {
        let line = shuffle_line("d", |_, white| {
            if white {
                ":10:10".to_string()
            } else {
                ":-10:10".to_string()
            }
        });
        let verdict = process_line(&line, &ImportOptions::default()).unwrap();
        assert!(matches!(verdict, LineVerdict::Accepted { result: GameResult::Draw, .. }));
    }

    #[test]
    fn accepts_positional_draw_without_scores() {
        // No annotations at all; the shuffle repeats the starting position,
        // which sets the draw flag.
        let line = shuffle_line("d", |_, _| String::new());
        let verdict = process_line(&line, &ImportOptions::default()).unwrap();
        match verdict {
            LineVerdict::Accepted { entries, .. } => assert!(entries.is_empty()),
            other => panic!("expected acceptance, got {:?}", other),
        }
    }

    #[test]
    fn ignores_uncorroborated_win() {
        let line = shuffle_line("w", |_, _| String::new());
        let verdict = process_line(&line, &ImportOptions::default()).unwrap();
        assert_eq!(verdict, LineVerdict::Ignored(IgnoreReason::LowConfidence));
    }

    #[test]
    fn decisive_score_alone_is_not_enough() {
        // A single mate-range annotation names the winner but builds no
        // weight; the declared win stays uncorroborated.
        let line = shuffle_line("w", |ply, white| {
            if white && ply == 0 {
                format!(":{}:10", VALUE_TB_WIN_IN_MAX_PLY + 5)
            } else {
                String::new()
            }
        });
        let verdict = process_line(&line, &ImportOptions::default()).unwrap();
        assert_eq!(verdict, LineVerdict::Ignored(IgnoreReason::LowConfidence));
    }

    #[test]
    fn decisive_score_with_weight_is_accepted() {
        let line = shuffle_line("w", |ply, white| {
            if !white {
                String::new()
            } else if ply == 0 {
                format!(":{}:10", VALUE_TB_WIN_IN_MAX_PLY + 5)
            } else {
                ":700:10".to_string()
            }
        });
        let verdict = process_line(&line, &ImportOptions::default()).unwrap();
        match verdict {
            LineVerdict::Accepted {
                result,
                entries,
                filtered,
            } => {
                assert_eq!(result, GameResult::WhiteWin);
                // The mate-range annotation itself is filtered by the value
                // window; the bucket-scored moves persist.
                assert_eq!(filtered, 1);
                assert_eq!(entries.len(), 7);
            }
            other => panic!("expected acceptance, got {:?}", other),
        }
    }

    #[test]
    fn ignores_mate_contradicting_declared_result() {
        // White is winning by a mate-range score but the game claims black
        // won.
        let line = shuffle_line("b", |_, white| {
            if white {
                format!(":{}:10", VALUE_TB_WIN_IN_MAX_PLY + 5)
            } else {
                String::new()
            }
        });
        let verdict = process_line(&line, &ImportOptions::default()).unwrap();
        assert_eq!(verdict, LineVerdict::Ignored(IgnoreReason::ResultMismatch));
    }

    #[test]
    fn ignores_short_game() {
        let line = format!("{{{}, w, g1f3:700:10, b8c6:-650:10}}", STARTPOS);
        let verdict = process_line(&line, &ImportOptions::default()).unwrap();
        assert_eq!(verdict, LineVerdict::Ignored(IgnoreReason::TooShort));
    }

    #[test]
    fn filters_out_of_window_annotations() {
        let line = shuffle_line("w", |ply, white| {
            if white {
                // Half the white moves are searched too shallow to keep.
                let depth = if ply % 4 == 0 { 2 } else { 10 };
                format!(":700:{}", depth)
            } else {
                ":-650:10".to_string()
            }
        });
        let verdict = process_line(&line, &ImportOptions::default()).unwrap();
        match verdict {
            LineVerdict::Accepted {
                entries, filtered, ..
            } => {
                assert_eq!(filtered, 4);
                assert_eq!(entries.len(), 12);
            }
            other => panic!("expected acceptance, got {:?}", other),
        }
    }

    #[test]
    fn rejects_illegal_move() {
        let line = format!("{{{}, w, e2e5:100:10}}", STARTPOS);
        let err = process_line(&line, &ImportOptions::default()).unwrap_err();
        assert!(matches!(err, CpgnError::Game(GameError::IllegalMove(_))));
    }

    #[test]
    fn rejects_unknown_result_code() {
        let line = format!("{{{}, x, e2e4:100:10}}", STARTPOS);
        let err = process_line(&line, &ImportOptions::default()).unwrap_err();
        assert_eq!(err, CpgnError::UnknownResult("x".to_string()));
    }

    #[test]
    fn rejects_unbraced_line() {
        let err = process_line("fen, w, e2e4", &ImportOptions::default()).unwrap_err();
        assert_eq!(err, CpgnError::NotBraced);
    }

    #[test]
    fn rejects_bad_annotation() {
        let line = format!("{{{}, w, e2e4:abc:10}}", STARTPOS);
        let err = process_line(&line, &ImportOptions::default()).unwrap_err();
        assert!(matches!(err, CpgnError::BadAnnotation(_)));
    }

    #[test]
    fn strips_check_suffixes() {
        // 16 plies ending with a checking move carrying a `+`.
        let mut line = format!("{{{}, d", STARTPOS);
        let moves = [
            "e2e4", "e7e5", "g1f3", "b8c6", "f1c4", "g8f6", "f3g1", "f6g8", "g1f3", "g8f6",
            "f3g1", "f6g8", "g1f3", "g8f6", "c4f7+", "e8f7",
        ];
        for lan in moves {
            line.push_str(", ");
            line.push_str(lan);
            line.push_str(":0:10");
        }
        line.push('}');
        let verdict = process_line(&line, &ImportOptions::default()).unwrap();
        assert!(matches!(verdict, LineVerdict::Accepted { .. }));
    }
}
