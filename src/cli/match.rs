use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use log::{error, info};
use tokio::task::block_in_place;

use crate::cli::SubCommandExtend;
use crate::config::{Opts, SearchOptions};
use crate::feature::FeatureExtractor;
use crate::matcher::{self, Match};
use crate::sift::SiftExtractor;
use crate::store::{IndexStore, OpenMode};
use crate::utils;

#[derive(Parser, Debug, Clone)]
pub struct MatchCommand {
    #[command(flatten)]
    pub search: SearchOptions,
    /// 被搜索的图片路径
    #[arg(required = true)]
    pub images: Vec<PathBuf>,
    /// 以匹配到的图片路径作为参数执行该命令，按匹配度从低到高排列
    #[arg(short, long, value_name = "CMD")]
    pub exec: Option<String>,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", value_enum, default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Table,
}

impl SubCommandExtend for MatchCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        block_in_place(|| {
            let store = IndexStore::open(&opts.db, OpenMode::ReadOnly)?;
            let pool = utils::thread_pool(self.search.threads)?;
            let params = self.search.params();
            let extractor = SiftExtractor::default();

            let mut all = vec![];
            for image in &self.images {
                eprintln!("Matching {}", image.display());
                let query = match extractor.extract(image) {
                    Ok(query) => query,
                    Err(e) => {
                        error!("{}: {:#}", image.display(), e);
                        continue;
                    }
                };
                info!("{}: {} 个特征点", image.display(), query.len());

                let mut matches = match matcher::match_features(&store, &query, &params, &pool) {
                    Ok(matches) => matches,
                    Err(e) => {
                        error!("{}: {:#}", image.display(), e);
                        continue;
                    }
                };
                matcher::rank(&mut matches);

                if self.exec.is_none() && self.output_format == OutputFormat::Table {
                    print_table(&matches);
                }
                all.extend(matches);
            }

            match &self.exec {
                Some(cmd) => exec(cmd, &all, opts.verbose),
                None if self.output_format == OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&all)?);
                    Ok(())
                }
                None => Ok(()),
            }
        })
    }
}

fn print_table(matches: &[Match]) {
    let interactive = std::io::stdout().is_terminal();
    for m in matches {
        if interactive {
            println!("{}: {} matches [{} %]", m.path, m.matched, m.percent);
        } else {
            println!("{}", m.path);
        }
    }
}

/// 把匹配结果追加到命令末尾，然后用该命令替换当前进程
fn exec(cmd: &str, matches: &[Match], verbose: bool) -> Result<()> {
    let mut args = cmd.split_whitespace();
    let Some(program) = args.next() else {
        bail!("要执行的命令为空");
    };
    let mut command = Command::new(program);
    command.args(args).args(matches.iter().map(|m| &m.path));

    if verbose {
        let line = std::iter::once(cmd).chain(matches.iter().map(|m| m.path.as_str()));
        eprintln!("{}", line.collect::<Vec<_>>().join(" "));
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // 只有失败时才会返回
        let err = command.exec();
        Err(err).with_context(|| format!("无法执行 '{}'", program))
    }

    #[cfg(not(unix))]
    {
        let status = command.status().with_context(|| format!("无法执行 '{}'", program))?;
        std::process::exit(status.code().unwrap_or(1));
    }
}
