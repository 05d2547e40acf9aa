// Copyright 2022 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::path::PathBuf;

use structopt::StructOpt;
use tracing_subscriber::{filter::LevelFilter, EnvFilter, FmtSubscriber};

use sugarexp::{
    game::Game,
    import::{self, ImportOptions},
    show, store,
    values::VALUE_TB_WIN_IN_MAX_PLY,
    ExperienceStore,
};

/// Offline maintenance for experience files.
#[derive(Debug, StructOpt)]
enum Options {
    /// Rewrite an experience file in canonical form.
    Defrag {
        #[structopt(name = "FILE")]
        file: PathBuf,
    },
    /// Union experience files into a target file.
    Merge {
        #[structopt(name = "TARGET")]
        target: PathBuf,
        #[structopt(name = "SOURCE", required = true)]
        sources: Vec<PathBuf>,
    },
    /// Import a compact game log into an experience file.
    Import {
        #[structopt(name = "CPGN")]
        src: PathBuf,
        #[structopt(name = "EXP")]
        dst: PathBuf,
        /// Discard moves searched shallower than this depth.
        #[structopt(long, default_value = "4")]
        min_depth: i32,
        /// Discard moves searched deeper than this depth.
        #[structopt(long, default_value = "64")]
        max_depth: i32,
        /// Discard moves whose absolute score exceeds this value.
        #[structopt(long)]
        max_value: Option<i32>,
    },
    /// Print the ranked entries recorded for a position.
    Show {
        #[structopt(name = "FILE")]
        file: PathBuf,
        #[structopt(name = "FEN")]
        fen: String,
        /// How much remembered evaluations weigh against observation
        /// counts, 0 to 10.
        #[structopt(long, default_value = "5")]
        eval_importance: u32,
    },
    /// Create an experience file holding only the signature.
    Touch {
        #[structopt(name = "FILE")]
        file: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(LevelFilter::INFO)
        .with_env_filter(EnvFilter::from_env("SUGAREXP_LOG"))
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    match Options::from_args() {
        Options::Defrag { file } => {
            let summary = store::defrag(&file)?;
            println!("{}: {} entries", file.display(), summary.total_written);
        }
        Options::Merge { target, sources } => {
            let summary = store::merge(&target, &sources)?;
            println!(
                "merged {} files into {}: {} entries",
                sources.len(),
                target.display(),
                summary.total_written
            );
        }
        Options::Import {
            src,
            dst,
            min_depth,
            max_depth,
            max_value,
        } => {
            let options = ImportOptions {
                min_depth,
                max_depth,
                max_value: max_value.unwrap_or(VALUE_TB_WIN_IN_MAX_PLY - 1),
            };
            let summary = import::import_cpgn(&src, &dst, &options, |progress| {
                let s = progress.summary;
                println!(
                    "{:5.1}%  {} games (w {} b {} d {}), {} errors, {} ignored, {} moves, \
                     {} bytes",
                    progress.percent,
                    s.games,
                    s.white_wins,
                    s.black_wins,
                    s.draws,
                    s.errors,
                    s.ignored,
                    s.moves_staged,
                    s.bytes_written
                );
            })?;
            println!(
                "imported {} games into {} ({} entries)",
                summary.games,
                dst.display(),
                summary.moves_staged
            );
        }
        Options::Show {
            file,
            fen,
            eval_importance,
        } => {
            let mut store = ExperienceStore::new();
            let outcome = store
                .load(&file, true)
                .expect("synchronous load reports an outcome");
            anyhow::ensure!(outcome.ok, "failed to load {}", file.display());
            let mut game = Game::from_fen(&fen)?;
            let rows = show::ranked_entries(&store, &mut game, eval_importance.min(10));
            if rows.is_empty() {
                println!("no experience for this position");
            }
            for row in &rows {
                println!("{}", show::render(row, true));
            }
        }
        Options::Touch { file } => {
            ExperienceStore::new().touch(&file)?;
            println!("{}", file.display());
        }
    }
    Ok(())
}
