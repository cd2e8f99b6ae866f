use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::{ThreadPool, ThreadPoolBuilder};

/// 带速度的进度条样式
pub fn pb_style_speed() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {pos} ({per_sec}) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// 根据开关创建进度条，关闭时返回不会输出任何内容的进度条
pub fn progress_bar(enabled: bool) -> ProgressBar {
    if enabled {
        ProgressBar::no_length().with_style(pb_style_speed())
    } else {
        ProgressBar::hidden()
    }
}

/// 创建固定大小的线程池，0 表示使用 CPU 核心数
pub fn thread_pool(threads: usize) -> Result<ThreadPool> {
    let threads = if threads == 0 { num_cpus::get() } else { threads };
    Ok(ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("siftsearch-{i}"))
        .build()?)
}
