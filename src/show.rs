// Copyright 2022 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Inspection of the store: a quality-ranked listing of the entries
//! remembered for a position.
//!
//! The ranking does more than read the chain back. Each entry is scored by
//! a short look-ahead: the entry's move is played on the board and the walk
//! follows the best remembered reply up to ten plies, watching how each
//! side's recorded evaluations trend. The `eval_importance` knob (0 to 10)
//! balances that trend against the raw observation count: at 0 the listing
//! is ordered purely by how often a move was seen, at 10 purely by where
//! the remembered line leads.

use crate::{
    entry::ExperienceEntry,
    game::{self, Game},
    store::ExperienceStore,
    values,
};

/// How many plies the look-ahead follows the remembered line.
const LOOKAHEAD_PLIES: usize = 10;

/// One ranked listing row.
#[derive(Clone, Debug)]
pub struct ShowEntry {
    /// The move, long-algebraic.
    pub lan: String,
    pub entry: ExperienceEntry,
    pub quality: i64,
    /// Whether playing the move leads straight into a drawn position.
    pub maybe_draw: bool,
}

/// Scores one entry by look-ahead. Returns the quality and whether the
/// entry's move leads into a draw-by-position.
///
/// The board is restored before returning.
pub fn quality(
    store: &ExperienceStore,
    game: &mut Game,
    entry: &ExperienceEntry,
    eval_importance: u32,
) -> (i64, bool) {
    debug_assert!(eval_importance <= 10);
    let importance = i64::from(eval_importance);
    let us = game.side_to_move();
    let mut count_sum = i64::from(entry.count);
    let mut maybe_draw = false;

    if importance == 0 {
        if let Some(mv) = game::decode_move(game.current(), entry.mv) {
            game.do_move(mv);
            maybe_draw = game.is_draw();
            game.undo_move();
        }
        return (count_sum, maybe_draw);
    }

    let mut sum = [0i64; 2];
    let mut weight = [0i64; 2];
    let mut last: [Option<i64>; 2] = [None, None];
    last[us.to_index()] = Some(i64::from(entry.value));

    let mut current = *entry;
    let mut undo = 0;
    for ply in 0..LOOKAHEAD_PLIES {
        let Some(mv) = game::decode_move(game.current(), current.mv) else {
            break;
        };
        game.do_move(mv);
        undo += 1;
        if ply == 0 {
            maybe_draw = game.is_draw();
        }
        let Some(next) = store.find_best_entry(game.key()) else {
            break;
        };
        let side = game.side_to_move().to_index();
        if let Some(previous) = last[side] {
            sum[side] += i64::from(next.value) - previous;
            weight[side] += 1;
        }
        last[side] = Some(i64::from(next.value));
        if game.side_to_move() == us {
            count_sum += i64::from(next.count);
        }
        current = next;
    }
    for _ in 0..undo {
        game.undo_move();
    }

    let mut q = count_sum * (10 - importance);
    let us = us.to_index();
    let them = 1 - us;
    let total_weight = weight[us] + weight[them];
    if total_weight > 0 {
        let mut trend = sum[us];
        if weight[them] > 0 {
            trend -= sum[them];
        }
        q += trend * importance / total_weight;
    }
    (q / 10, maybe_draw)
}

/// Probes the store for the current position and returns the entries,
/// ranked by look-ahead quality (descending, stable).
pub fn ranked_entries(
    store: &ExperienceStore,
    game: &mut Game,
    eval_importance: u32,
) -> Vec<ShowEntry> {
    let chain = match store.probe(game.key()) {
        Some(chain) => chain,
        None => return Vec::new(),
    };
    let mut rows: Vec<ShowEntry> = chain
        .iter()
        .map(|entry| {
            let (quality, maybe_draw) = quality(store, game, entry, eval_importance);
            let lan = game::decode_move(game.current(), entry.mv)
                .map(|mv| mv.to_string())
                .unwrap_or_else(|| format!("0x{:08x}", entry.mv));
            ShowEntry {
                lan,
                entry: *entry,
                quality,
                maybe_draw,
            }
        })
        .collect();
    rows.sort_by(|a, b| b.quality.cmp(&a.quality));
    rows
}

/// Renders one listing row. The extended form appends the draw marker.
pub fn render(row: &ShowEntry, extended: bool) -> String {
    let mut text = format!(
        "{:<6} depth: {:>3}, value: {:>10}, count: {:>5}, quality: {:>6}",
        row.lan,
        row.entry.depth,
        values::format_value(row.entry.value),
        row.entry.count,
        row.quality
    );
    if extended && row.maybe_draw {
        text.push_str(" (draw)");
    }
    text
}
