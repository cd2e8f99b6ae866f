use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::block_in_place;

use crate::cli::SubCommandExtend;
use crate::config::Opts;
use crate::indexer::{IndexOptions, Indexer};
use crate::kdtree::KdTreeBuilder;
use crate::scan::DEFAULT_SUFFIX;
use crate::sift::SiftExtractor;
use crate::store::{IndexStore, OpenMode};

#[derive(Parser, Debug, Clone)]
pub struct IndexCommand {
    /// 图片所在目录
    pub dir: PathBuf,
    /// 索引前清空数据库
    #[arg(long)]
    pub clean: bool,
    /// 扫描的文件后缀名，多个后缀用逗号分隔
    #[arg(short, long, default_value = DEFAULT_SUFFIX)]
    pub suffix: String,
    /// 特征提取线程数，0 表示 CPU 核心数
    #[arg(short = 'j', long, value_name = "N", default_value_t = 0)]
    pub threads: usize,
}

impl SubCommandExtend for IndexCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let mode = if self.clean { OpenMode::Clean } else { OpenMode::Create };
        if let Some(parent) = opts.db.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("无法创建目录 '{}'", parent.display()))?;
        }
        let store = block_in_place(|| IndexStore::open(&opts.db, mode))?;

        // 数据库中保存绝对路径，之后在其他目录下搜索时结果仍然可用
        let root = std::path::absolute(&self.dir)
            .with_context(|| format!("无效的路径 '{}'", self.dir.display()))?;

        let indexer = Indexer::new(
            Arc::new(store),
            Arc::new(SiftExtractor::default()),
            Arc::new(KdTreeBuilder),
            IndexOptions {
                suffix: self.suffix.clone(),
                threads: self.threads,
                verbose: opts.verbose,
                progress: true,
            },
        );
        indexer.index_directory(root).await?;
        Ok(())
    }
}
