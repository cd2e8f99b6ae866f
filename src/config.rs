use std::path::PathBuf;
use std::sync::LazyLock;

use clap::{Parser, Subcommand};
use directories::ProjectDirs;

use crate::cli::*;
use crate::matcher::{DEFAULT_BATCH_SIZE, KDTREE_BBF_MAX_NN_CHKS, MatchParams};

static DEFAULT_DB: LazyLock<String> = LazyLock::new(|| {
    let dir = ProjectDirs::from("", "", "siftsearch")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_default();
    dir.join("siftsearch.db").to_string_lossy().into_owned()
});

fn default_db() -> &'static str {
    DEFAULT_DB.as_str()
}

#[derive(Parser, Debug, Clone)]
pub struct SearchOptions {
    /// 每批从数据库中读取的记录数
    #[arg(long, value_name = "N", default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,
    /// 每个特征点搜索时最多检查的叶子节点数
    #[arg(long, value_name = "N", default_value_t = KDTREE_BBF_MAX_NN_CHKS)]
    pub max_checks: usize,
    /// 匹配线程数，0 表示 CPU 核心数
    #[arg(short = 'j', long, value_name = "N", default_value_t = 0)]
    pub threads: usize,
}

impl SearchOptions {
    pub fn params(&self) -> MatchParams {
        MatchParams { batch_size: self.batch_size, max_checks: self.max_checks, ..Default::default() }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "siftsearch", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// 数据库文件路径
    #[arg(short, long, global = true, default_value = default_db())]
    pub db: PathBuf,
    /// 输出每个文件的处理过程
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 索引目录中的图片
    Index(IndexCommand),
    /// 列出数据库中的所有图片
    Dump(DumpCommand),
    /// 在数据库中搜索相似的图片
    Match(MatchCommand),
}
