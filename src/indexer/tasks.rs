use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::{Result, ensure};
use indicatif::ProgressBar;
use log::warn;
use rayon::ThreadPool;
use tokio::sync::mpsc::{Receiver, channel};
use tokio::task::{JoinHandle, spawn_blocking};

use super::IndexStats;
use crate::feature::FeatureExtractor;
use crate::kdtree::TreeBuilder;
use crate::packed;
use crate::scan::Scanner;
use crate::store::IndexStore;

/// 每次写事务最多包含的记录数
const STORE_BATCH: usize = 64;

/// 已经打包好、等待写入数据库的图片
pub struct PackedImage {
    pub path: String,
    pub num_features: usize,
    pub data: Vec<u8>,
}

/// 提取特征、建树并打包
pub fn pack_image(
    extractor: &dyn FeatureExtractor,
    builder: &dyn TreeBuilder,
    path: &str,
) -> Result<PackedImage> {
    let mut features = extractor.extract(Path::new(path))?;
    ensure!(!features.is_empty(), "没有找到特征点");
    let tree = builder.build(&mut features);
    let data = packed::pack(&features, &tree);
    Ok(PackedImage { path: path.to_owned(), num_features: features.len(), data })
}

/// 扫描目录，边扫描边发送路径
pub fn task_scan(
    scanner: Scanner,
    stats: Arc<IndexStats>,
) -> (JoinHandle<Result<()>>, Receiver<PathBuf>) {
    let (tx, rx) = channel(num_cpus::get());
    let t = spawn_blocking(move || {
        for path in scanner.walk()? {
            stats.scanned.fetch_add(1, Ordering::Relaxed);
            // 下游出错退出时停止扫描
            if tx.blocking_send(path).is_err() {
                break;
            }
        }
        Ok(())
    });
    (t, rx)
}

/// 过滤掉已经在数据库中的路径
pub fn task_filter(
    mut lrx: Receiver<PathBuf>,
    store: Arc<IndexStore>,
    pb: ProgressBar,
    stats: Arc<IndexStats>,
) -> (JoinHandle<Result<()>>, Receiver<String>) {
    let (tx, rx) = channel(num_cpus::get());
    let t = spawn_blocking(move || {
        while let Some(path) = lrx.blocking_recv() {
            let path = path.to_string_lossy().into_owned();
            if store.exists(&path)? {
                stats.skipped.fetch_add(1, Ordering::Relaxed);
                pb.set_message(format!("跳过已添加图片: {}", path));
                pb.inc(1);
                continue;
            }
            if tx.blocking_send(path).is_err() {
                break;
            }
        }
        Ok(())
    });
    (t, rx)
}

/// 在线程池中提取特征并打包
pub fn task_extract(
    mut lrx: Receiver<String>,
    extractor: Arc<dyn FeatureExtractor>,
    builder: Arc<dyn TreeBuilder>,
    pool: Arc<ThreadPool>,
    pb: ProgressBar,
    stats: Arc<IndexStats>,
    verbose: bool,
) -> (JoinHandle<Result<()>>, Receiver<PackedImage>) {
    let (tx, rx) = channel(pool.current_num_threads());
    let t = spawn_blocking(move || {
        let mut buffer = vec![];
        let (tx, pb, stats) = (&tx, &pb, &stats);
        let (extractor, builder) = (extractor.as_ref(), builder.as_ref());
        // NOTE: 一次只取一批路径，等这一批处理完再取下一批，避免同时创建太多任务
        while lrx.blocking_recv_many(&mut buffer, pool.current_num_threads() * 4) != 0 {
            // 写入任务已经退出，继续提取没有意义
            if tx.is_closed() {
                break;
            }
            pool.scope(|s| {
                for path in buffer.drain(..) {
                    s.spawn(move |_| {
                        if tx.is_closed() {
                            return;
                        }
                        let worker = rayon::current_thread_index().unwrap_or_default();
                        if verbose {
                            pb.suspend(|| eprintln!("[{:02}] {}", worker, path));
                        }
                        match pack_image(extractor, builder, &path) {
                            Ok(image) => {
                                if verbose {
                                    pb.suspend(|| {
                                        eprintln!(
                                            "[{:02}]   {} features detected",
                                            worker, image.num_features
                                        )
                                    });
                                }
                                let _ = tx.blocking_send(image);
                            }
                            Err(e) => {
                                stats.failed.fetch_add(1, Ordering::Relaxed);
                                pb.suspend(|| warn!("{}: {:#}", path, e));
                                pb.inc(1);
                            }
                        }
                    });
                }
            });
        }
        Ok(())
    });
    (t, rx)
}

/// 唯一的写入者，把打包好的记录写入数据库
pub fn task_store(
    mut lrx: Receiver<PackedImage>,
    store: Arc<IndexStore>,
    pb: ProgressBar,
    stats: Arc<IndexStats>,
) -> JoinHandle<Result<()>> {
    spawn_blocking(move || {
        let mut buffer = vec![];
        while lrx.blocking_recv_many(&mut buffer, STORE_BATCH) != 0 {
            let received = buffer.len();
            let mut entries = Vec::with_capacity(received);
            for image in buffer.drain(..) {
                // 这里再检查一次，因为处理过程中可能已经写入了相同的路径
                if store.exists(&image.path)? {
                    stats.skipped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                entries.push((image.path, image.data));
            }

            let written = store.put_many(&entries)?;
            stats.added.fetch_add(written, Ordering::Relaxed);
            stats.failed.fetch_add(entries.len() - written, Ordering::Relaxed);

            if let Some((path, _)) = entries.last() {
                pb.set_message(path.clone());
            }
            pb.inc(received as u64);
        }
        Ok(())
    })
}
