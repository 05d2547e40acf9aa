// Copyright 2022 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The board collaborator: everything the experience store needs from the
//! chess engine proper.
//!
//! The store itself is deliberately agnostic about chess. What it needs from
//! the outside world is small: a 64-bit fingerprint per position, a move
//! encoding it can compare for equality, a legality oracle, a do/undo
//! interface for look-ahead, and a draw predicate. This module provides all
//! of them on top of the `chess` crate's board, adding the game-history
//! bookkeeping (halfmove clock, repetition window) that a bare `Board` does
//! not carry.

use std::str::FromStr;

use chess::{Board, ChessMove, Color, MoveGen, Piece, Square};
use thiserror::Error;

/// Errors produced when building or advancing a game.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum GameError {
    #[error("invalid FEN: {0}")]
    InvalidFen(String),
    #[error("illegal move: {0}")]
    IllegalMove(String),
}

/// A playable game line: a current board plus enough history to undo moves
/// and detect draws.
#[derive(Clone, Debug)]
pub struct Game {
    boards: Vec<Board>,
    clocks: Vec<u32>,
    keys: Vec<u64>,
}

impl Game {
    /// Starts a game from the standard initial position.
    pub fn startpos() -> Game {
        Game::with_board(Board::default(), 0)
    }

    /// Starts a game from a FEN string. The halfmove clock (field five) is
    /// honored; `chess::Board` itself discards it.
    pub fn from_fen(fen: &str) -> Result<Game, GameError> {
        let board =
            Board::from_str(fen).map_err(|_| GameError::InvalidFen(fen.trim().to_string()))?;
        let clock = fen
            .split_whitespace()
            .nth(4)
            .and_then(|field| field.parse().ok())
            .unwrap_or(0);
        Ok(Game::with_board(board, clock))
    }

    fn with_board(board: Board, clock: u32) -> Game {
        let key = board.get_hash();
        Game {
            boards: vec![board],
            clocks: vec![clock],
            keys: vec![key],
        }
    }

    pub fn current(&self) -> &Board {
        self.boards.last().unwrap()
    }

    /// The position fingerprint of the current board.
    pub fn key(&self) -> u64 {
        *self.keys.last().unwrap()
    }

    pub fn side_to_move(&self) -> Color {
        self.current().side_to_move()
    }

    /// Plies played since this game was constructed.
    pub fn ply(&self) -> usize {
        self.boards.len() - 1
    }

    pub fn halfmove_clock(&self) -> u32 {
        *self.clocks.last().unwrap()
    }

    /// Resolves a long-algebraic token such as `e2e4` or `a7a8q` against the
    /// legal moves of the current position.
    pub fn resolve_move(&self, lan: &str) -> Result<ChessMove, GameError> {
        let illegal = || GameError::IllegalMove(lan.to_string());
        if lan.len() < 4 || !lan.is_ascii() {
            return Err(illegal());
        }
        let from = Square::from_str(&lan[0..2]).map_err(|_| illegal())?;
        let to = Square::from_str(&lan[2..4]).map_err(|_| illegal())?;
        let promotion = match lan.as_bytes().get(4).copied() {
            None => None,
            Some(b'q') | Some(b'Q') => Some(Piece::Queen),
            Some(b'r') | Some(b'R') => Some(Piece::Rook),
            Some(b'b') | Some(b'B') => Some(Piece::Bishop),
            Some(b'n') | Some(b'N') => Some(Piece::Knight),
            Some(_) => return Err(illegal()),
        };
        let mv = ChessMove::new(from, to, promotion);
        if self.current().legal(mv) {
            Ok(mv)
        } else {
            Err(illegal())
        }
    }

    /// Plays a move, which must be legal in the current position.
    pub fn do_move(&mut self, mv: ChessMove) {
        let board = self.current();
        debug_assert!(board.legal(mv));
        let pawn_move = board.piece_on(mv.get_source()) == Some(Piece::Pawn);
        // En-passant lands on an empty square, so a pawn changing file is a
        // capture even when the destination holds nothing.
        let capture = board.piece_on(mv.get_dest()).is_some()
            || (pawn_move && mv.get_source().get_file() != mv.get_dest().get_file());
        let clock = if pawn_move || capture {
            0
        } else {
            self.halfmove_clock() + 1
        };
        let next = board.make_move_new(mv);
        self.keys.push(next.get_hash());
        self.boards.push(next);
        self.clocks.push(clock);
    }

    /// Takes back the most recent move. Panics if no move has been played.
    pub fn undo_move(&mut self) {
        assert!(self.boards.len() > 1, "undo_move with no move played");
        self.boards.pop();
        self.clocks.pop();
        self.keys.pop();
    }

    /// Draw-by-position: repetition within the halfmove window, the 50-move
    /// rule, or insufficient material (bare kings, a lone minor piece, or a
    /// bishop ending where every bishop stands on the same square color).
    pub fn is_draw(&self) -> bool {
        if self.halfmove_clock() >= 100 {
            return true;
        }
        if self.is_repetition() {
            return true;
        }
        self.has_insufficient_material()
    }

    fn is_repetition(&self) -> bool {
        let key = self.key();
        let window = self.halfmove_clock().min(self.ply() as u32) as usize;
        let prior = &self.keys[self.keys.len() - 1 - window..self.keys.len() - 1];
        prior.iter().any(|&k| k == key)
    }

    fn has_insufficient_material(&self) -> bool {
        let board = self.current();
        let heavy = board.pieces(Piece::Pawn)
            | board.pieces(Piece::Rook)
            | board.pieces(Piece::Queen);
        if heavy != chess::EMPTY {
            return false;
        }
        let knights = board.pieces(Piece::Knight).popcnt();
        let bishops = *board.pieces(Piece::Bishop);
        let minors = knights + bishops.popcnt();
        if minors <= 1 {
            return true;
        }
        if knights > 0 {
            return false;
        }
        let mut dark = false;
        let mut light = false;
        for sq in bishops {
            if (sq.get_rank().to_index() + sq.get_file().to_index()) % 2 == 0 {
                dark = true;
            } else {
                light = true;
            }
        }
        dark != light
    }
}

/// Packs a move into the store's opaque 32-bit encoding: source square,
/// destination square, and promotion piece.
pub fn encode_move(mv: ChessMove) -> u32 {
    let promotion: u32 = match mv.get_promotion() {
        None => 0,
        Some(Piece::Knight) => 1,
        Some(Piece::Bishop) => 2,
        Some(Piece::Rook) => 3,
        Some(Piece::Queen) => 4,
        // Kings and pawns are unreachable promotion targets.
        Some(_) => 0,
    };
    mv.get_source().to_index() as u32
        | (mv.get_dest().to_index() as u32) << 6
        | promotion << 12
}

/// Recovers a legal move from its packed encoding by matching against the
/// position's legal moves, or `None` when no legal move carries that
/// encoding (the position differs from the one the entry was recorded in).
pub fn decode_move(board: &Board, raw: u32) -> Option<ChessMove> {
    MoveGen::new_legal(board).find(|&m| encode_move(m) == raw)
}
