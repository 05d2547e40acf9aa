// Copyright 2022 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The UCI-facing command surface of the experience store.
//!
//! This is the control plane the enclosing engine exposes: the `exp` family
//! of inspection commands, file maintenance (`defrag`, `merge`,
//! `import_cpgn`, `cpgn_to_exp`), the experience options, and the lifecycle
//! hooks (`ucinewgame`, `bench`, `quit`). Command failures never terminate
//! the process; they are reported as `info string` lines and the command
//! returns.

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::str::FromStr;

use chess::{Board, MoveGen};

use crate::{
    game::Game,
    import::{self, ImportOptions, ImportProgress},
    show,
    store::{self, ExperienceStore},
};

/// Default value of the `Experience File` option.
pub const DEFAULT_EXPERIENCE_FILE: &str = "experience.exp";

const DEFAULT_EVAL_IMPORTANCE: u32 = 5;

/// Positions the `bench` command walks, beyond the starting position.
const BENCH_FENS: &[&str] = &[
    "r3k2r/p1ppqpb1/bn2pnp1/3PN3/1p2P3/2N2Q1p/PPPBBPPP/R3K2R w KQkq - 0 1",
    "8/2p5/3p4/KP5r/1R3p1k/8/4P1P1/8 w - - 0 1",
    "r4rk1/1pp1qppp/p1np1n2/2b1p1B1/2B1P1b1/P1NP1N2/1PP1QPPP/R4RK1 w - - 0 10",
];

/// Handler for the experience command surface.
pub struct UciHandler {
    store: ExperienceStore,
    game: Game,
    experience_file: String,
    eval_importance: u32,
    load_reported: bool,
    quit: bool,
}

impl Default for UciHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl UciHandler {
    pub fn new() -> UciHandler {
        UciHandler {
            store: ExperienceStore::new(),
            game: Game::startpos(),
            experience_file: DEFAULT_EXPERIENCE_FILE.to_string(),
            eval_importance: DEFAULT_EVAL_IMPORTANCE,
            load_reported: false,
            quit: false,
        }
    }

    /// Runs the command loop over standard input until `quit` or EOF.
    pub fn run(&mut self) -> io::Result<()> {
        self.store.init(&self.experience_file);
        let stdin = io::stdin();
        let locked_stdin = stdin.lock();
        for maybe_line in locked_stdin.lines() {
            let line = maybe_line?;
            self.dispatch(&line);
            if self.quit {
                break;
            }
        }
        Ok(())
    }

    /// Dispatches a single command line.
    pub fn dispatch(&mut self, line: &str) {
        let components: Vec<_> = line.split_whitespace().collect();
        let (&command, arguments) = components.split_first().unwrap_or((&"", &[]));
        match (command, arguments) {
            ("", _) => {}
            ("uci", []) => self.handle_uci(),
            ("isready", []) => {
                self.store.wait_for_loading_finished();
                self.report_load_result();
                uci_output!("readyok");
            }
            ("setoption", args) => self.handle_setoption(args),
            ("position", args) => self.handle_position(args),
            ("ucinewgame", []) => self.handle_newgame(),
            ("exp", []) => self.handle_show(false),
            ("expex", []) => self.handle_show(true),
            ("defrag", []) => self.handle_defrag(None),
            ("defrag", [path]) => self.handle_defrag(Some(*path)),
            ("merge", args) if args.len() >= 2 => self.handle_merge(args),
            ("merge", _) => {
                uci_output!("info string syntax: merge <target> <source1> [source2 ...]")
            }
            ("import_cpgn", [src]) => {
                let dst = self.experience_file.clone();
                self.handle_import(src, &dst);
            }
            ("import_cpgn", _) => uci_output!("info string syntax: import_cpgn <file.cpgn>"),
            ("cpgn_to_exp", [src, dst]) => {
                let (src, dst) = (src.to_string(), dst.to_string());
                self.handle_import(&src, &dst);
            }
            ("cpgn_to_exp", _) => {
                uci_output!("info string syntax: cpgn_to_exp <file.cpgn> <file.exp>")
            }
            ("import_pgn", _) | ("pgn_to_exp", _) => {
                uci_output!(
                    "info string PGN import is not supported; convert the games to compact \
                     form and use import_cpgn <file.cpgn>"
                )
            }
            ("pause_learning", []) => self.store.pause_learning(),
            ("resume_learning", []) => self.store.resume_learning(),
            ("bench", []) => self.handle_bench(),
            ("quit", []) => self.handle_quit(),
            _ => uci_output!("info string unrecognized command: {} {:?}", command, arguments),
        }
    }

    fn handle_uci(&mut self) {
        uci_output!(
            "id name {} {}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        );
        uci_output!("id author {}", env!("CARGO_PKG_AUTHORS"));
        uci_output!(
            "option name Experience File type string default {}",
            DEFAULT_EXPERIENCE_FILE
        );
        uci_output!("option name Experience Enabled type check default true");
        uci_output!("option name Experience Readonly type check default false");
        uci_output!(
            "option name Experience Book Eval Importance type spin default {} min 0 max 10",
            DEFAULT_EVAL_IMPORTANCE
        );
        uci_output!("uciok");
    }

    fn handle_setoption(&mut self, args: &[&str]) {
        // setoption name <name ...> value <value ...>; option names contain
        // spaces.
        if args.first() != Some(&"name") {
            uci_output!("info string syntax: setoption name <name> value <value>");
            return;
        }
        let value_at = args.iter().position(|&a| a == "value");
        let name = args[1..value_at.unwrap_or(args.len())].join(" ");
        let value = value_at
            .map(|at| args[at + 1..].join(" "))
            .unwrap_or_default();
        match name.as_str() {
            "Experience File" => {
                if value.is_empty() {
                    uci_output!("info string Experience File requires a path");
                    return;
                }
                self.store.unload();
                self.experience_file = value;
                self.store.load(&self.experience_file, false);
                self.load_reported = false;
            }
            "Experience Enabled" => self.store.set_enabled(value == "true"),
            "Experience Readonly" => self.store.set_readonly(value == "true"),
            "Experience Book Eval Importance" => match value.parse::<u32>() {
                Ok(importance) if importance <= 10 => self.eval_importance = importance,
                _ => uci_output!("info string Experience Book Eval Importance must be 0..10"),
            },
            _ => uci_output!("info string unknown option: {}", name),
        }
    }

    fn handle_position(&mut self, args: &[&str]) {
        let (game, rest) = match args {
            ["startpos", rest @ ..] => (Ok(Game::startpos()), rest),
            ["fen", rest @ ..] => {
                let end = rest
                    .iter()
                    .position(|&a| a == "moves")
                    .unwrap_or(rest.len());
                (Game::from_fen(&rest[..end].join(" ")), &rest[end..])
            }
            _ => {
                uci_output!("info string syntax: position startpos|fen <fen> [moves ...]");
                return;
            }
        };
        let mut game = match game {
            Ok(game) => game,
            Err(err) => {
                uci_output!("info string {}", err);
                return;
            }
        };
        let moves = match rest {
            ["moves", rest @ ..] => rest,
            _ => &[],
        };
        for lan in moves {
            match game.resolve_move(lan) {
                Ok(mv) => game.do_move(mv),
                Err(err) => {
                    uci_output!("info string {}", err);
                    return;
                }
            }
        }
        self.game = game;
    }

    fn handle_newgame(&mut self) {
        let path = self.experience_file.clone();
        if let Err(err) = self.store.save(&path, false, false) {
            uci_output!("info string {}", err);
        }
        self.store.resume_learning();
    }

    fn handle_show(&mut self, extended: bool) {
        self.store.wait_for_loading_finished();
        let rows = show::ranked_entries(&self.store, &mut self.game, self.eval_importance);
        if rows.is_empty() {
            uci_output!("info string no experience for the current position");
            return;
        }
        for row in &rows {
            uci_output!("{}", show::render(row, extended));
        }
    }

    fn handle_defrag(&mut self, path: Option<&str>) {
        self.store.wait_for_loading_finished();
        let path = path.unwrap_or(&self.experience_file).to_string();
        match store::defrag(&path) {
            Ok(summary) => uci_output!(
                "info string defragged {}: {} entries",
                path,
                summary.total_written
            ),
            Err(err) => uci_output!("info string {}", err),
        }
    }

    fn handle_merge(&mut self, args: &[&str]) {
        self.store.wait_for_loading_finished();
        let target = args[0].to_string();
        let sources: Vec<PathBuf> = args[1..].iter().map(|&s| PathBuf::from(s)).collect();
        match store::merge(&target, &sources) {
            Ok(summary) => uci_output!(
                "info string merged {} files into {}: {} entries",
                sources.len(),
                target,
                summary.total_written
            ),
            Err(err) => uci_output!("info string {}", err),
        }
    }

    fn handle_import(&mut self, src: &str, dst: &str) {
        self.store.wait_for_loading_finished();
        let report = |progress: &ImportProgress<'_>| {
            let s = progress.summary;
            uci_output!(
                "info string import {:.1}%: {} games (w {} b {} d {}), {} errors, {} ignored, \
                 {} moves, {} filtered, {} bytes",
                progress.percent,
                s.games,
                s.white_wins,
                s.black_wins,
                s.draws,
                s.errors,
                s.ignored,
                s.moves_staged,
                s.moves_filtered,
                s.bytes_written
            );
        };
        match import::import_cpgn(src, dst, &ImportOptions::default(), report) {
            Ok(summary) => {
                uci_output!(
                    "info string imported {} games into {} ({} entries)",
                    summary.games,
                    dst,
                    summary.moves_staged
                );
                if dst == self.experience_file {
                    self.store.unload();
                    self.store.load(&self.experience_file, false);
                    self.load_reported = false;
                }
            }
            Err(err) => uci_output!("info string {}", err),
        }
    }

    fn handle_bench(&mut self) {
        self.store.begin_bench();
        if let Err(err) = self.store.touch(&self.experience_file) {
            uci_output!("info string {}", err);
        }
        let mut nodes = perft(&Board::default(), 3);
        for fen in BENCH_FENS {
            match Board::from_str(fen) {
                Ok(board) => nodes += perft(&board, 3),
                Err(_) => uci_output!("info string bad bench position: {}", fen),
            }
        }
        self.store.end_bench();
        uci_output!("info string bench: {} nodes", nodes);
    }

    fn handle_quit(&mut self) {
        self.store.unload();
        self.quit = true;
    }

    fn report_load_result(&mut self) {
        if self.load_reported {
            return;
        }
        let outcome = match self.store.load_result() {
            Some(outcome) => outcome,
            None => return,
        };
        self.load_reported = true;
        if outcome.ok {
            uci_output!(
                "info string experience file {}: {} moves, {} new positions, {} duplicates",
                self.experience_file,
                outcome.total_moves,
                outcome.new_positions,
                outcome.duplicates
            );
            if let Some(fragmentation) = outcome.fragmentation {
                uci_output!(
                    "info string experience fragmentation: {:.2}%",
                    fragmentation
                );
            }
        } else if outcome.cancelled {
            uci_output!("info string experience load cancelled");
        } else {
            uci_output!(
                "info string failed to load experience file {}",
                self.experience_file
            );
        }
    }
}

fn perft(board: &Board, depth: u32) -> u64 {
    if depth == 0 {
        return 1;
    }
    MoveGen::new_legal(board)
        .map(|mv| perft(&board.make_move_new(mv), depth - 1))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_startpos_with_moves() {
        let mut handler = UciHandler::new();
        let before = handler.game.key();
        handler.dispatch("position startpos moves e2e4 e7e5");
        assert_ne!(handler.game.key(), before);
        assert_eq!(handler.game.ply(), 2);
    }

    #[test]
    fn position_fen() {
        let mut handler = UciHandler::new();
        handler.dispatch("position fen 8/8/4k3/8/8/3K4/8/8 w - - 0 1");
        assert!(handler.game.is_draw());
    }

    #[test]
    fn illegal_position_is_rejected() {
        let mut handler = UciHandler::new();
        handler.dispatch("position startpos moves e2e4 e7e5");
        let key = handler.game.key();
        handler.dispatch("position startpos moves e2e5");
        assert_eq!(handler.game.key(), key);
    }

    #[test]
    fn setoption_eval_importance() {
        let mut handler = UciHandler::new();
        handler.dispatch("setoption name Experience Book Eval Importance value 8");
        assert_eq!(handler.eval_importance, 8);
        handler.dispatch("setoption name Experience Book Eval Importance value 99");
        assert_eq!(handler.eval_importance, 8);
    }

    #[test]
    fn setoption_gates() {
        let mut handler = UciHandler::new();
        handler.dispatch("setoption name Experience Readonly value true");
        assert!(handler.store.is_readonly());
        handler.dispatch("setoption name Experience Enabled value false");
        assert!(!handler.store.is_enabled());
    }

    #[test]
    fn pause_and_resume() {
        let mut handler = UciHandler::new();
        handler.dispatch("pause_learning");
        assert!(handler.store.is_paused());
        handler.dispatch("resume_learning");
        assert!(!handler.store.is_paused());
    }

    #[test]
    fn perft_counts_legal_moves() {
        assert_eq!(perft(&Board::default(), 1), 20);
        assert_eq!(perft(&Board::default(), 2), 400);
    }
}
