use std::io::{self, BufWriter, Write};

use anyhow::Result;
use clap::Parser;
use log::warn;
use tokio::task::block_in_place;

use crate::cli::SubCommandExtend;
use crate::config::Opts;
use crate::packed;
use crate::store::{IndexStore, OpenMode};

#[derive(Parser, Debug, Clone)]
pub struct DumpCommand {
    /// 只输出记录数量
    #[arg(long)]
    pub count: bool,
}

impl SubCommandExtend for DumpCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        block_in_place(|| {
            let store = IndexStore::open(&opts.db, OpenMode::ReadOnly)?;
            if self.count {
                println!("{}", store.len()?);
                return Ok(());
            }

            let mut stdout = BufWriter::new(io::stdout().lock());
            let rtxn = store.read_txn()?;
            for item in store.iter(&rtxn)? {
                let (path, data) = item?;
                if opts.verbose {
                    match packed::read_header(data) {
                        Ok(header) => writeln!(
                            stdout,
                            "{}\t{} features, {} nodes",
                            path, header.feature_count, header.node_count
                        )?,
                        Err(e) => warn!("{}: {:#}", path, e),
                    }
                } else {
                    writeln!(stdout, "{}", path)?;
                }
            }
            stdout.flush()?;
            Ok(())
        })
    }
}
