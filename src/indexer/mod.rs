//! 索引流水线：扫描 -> 过滤 -> 提取特征 -> 写入
//!
//! 各阶段之间使用有界的 channel 连接，特征提取在 rayon 线程池中并行，
//! 写入只在唯一的一个任务中进行。

mod tasks;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use log::{error, info};
use serde::Serialize;

pub use self::tasks::{PackedImage, pack_image};
use crate::feature::FeatureExtractor;
use crate::kdtree::TreeBuilder;
use crate::scan::{DEFAULT_SUFFIX, Scanner};
use crate::store::IndexStore;
use crate::utils;

#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// 逗号分隔的后缀列表
    pub suffix: String,
    /// 特征提取线程数，0 表示 CPU 核心数
    pub threads: usize,
    /// 打印每张图片的处理过程
    pub verbose: bool,
    /// 显示进度条
    pub progress: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self { suffix: DEFAULT_SUFFIX.to_owned(), threads: 0, verbose: false, progress: true }
    }
}

#[derive(Debug, Default)]
pub(crate) struct IndexStats {
    scanned: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    added: AtomicUsize,
}

impl IndexStats {
    fn report(&self) -> IndexReport {
        IndexReport {
            scanned: self.scanned.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            added: self.added.load(Ordering::Relaxed),
        }
    }
}

/// 一次索引的统计结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    /// 扫描到的候选文件
    pub scanned: usize,
    /// 已经存在而跳过的文件
    pub skipped: usize,
    /// 无法解码、没有特征点或写入失败的文件
    pub failed: usize,
    /// 新写入的记录
    pub added: usize,
}

pub struct Indexer {
    store: Arc<IndexStore>,
    extractor: Arc<dyn FeatureExtractor>,
    builder: Arc<dyn TreeBuilder>,
    options: IndexOptions,
}

impl Indexer {
    pub fn new(
        store: Arc<IndexStore>,
        extractor: Arc<dyn FeatureExtractor>,
        builder: Arc<dyn TreeBuilder>,
        options: IndexOptions,
    ) -> Self {
        Self { store, extractor, builder, options }
    }

    /// 索引目录下所有匹配后缀的图片，已经存在的路径会被跳过
    ///
    /// 根目录无法打开时，等其他阶段退出后返回错误
    pub async fn index_directory(&self, root: impl Into<PathBuf>) -> Result<IndexReport> {
        let scanner = Scanner::new(root, &self.options.suffix)?;
        let pool = Arc::new(utils::thread_pool(self.options.threads)?);
        let stats = Arc::new(IndexStats::default());
        let pb = utils::progress_bar(self.options.progress);

        let (t1, rx) = tasks::task_scan(scanner, stats.clone());
        let (t2, rx) = tasks::task_filter(rx, self.store.clone(), pb.clone(), stats.clone());
        let (t3, rx) = tasks::task_extract(
            rx,
            self.extractor.clone(),
            self.builder.clone(),
            pool,
            pb.clone(),
            stats.clone(),
            self.options.verbose,
        );
        let t4 = tasks::task_store(rx, self.store.clone(), pb.clone(), stats.clone());

        let (r1, r2, r3, r4) = tokio::try_join!(t1, t2, t3, t4)?;
        pb.finish_and_clear();

        let report = stats.report();
        for r in [r1, r2, r3, r4] {
            if let Err(e) = r {
                error!("索引中断: {:#}", e);
                return Err(e);
            }
        }

        info!(
            "索引完成: 扫描 {}，跳过 {}，失败 {}，新增 {}",
            report.scanned, report.skipped, report.failed, report.added
        );
        Ok(report)
    }
}
