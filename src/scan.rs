use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};
use log::{info, warn};
use regex::Regex;
use walkdir::WalkDir;

/// 默认扫描的图片后缀
pub const DEFAULT_SUFFIX: &str = "jpg,jpeg,png,bmp,gif";

/// 递归扫描目录中指定后缀的文件
#[derive(Debug, Clone)]
pub struct Scanner {
    root: PathBuf,
    suffix: Regex,
}

impl Scanner {
    /// `suffix` 为逗号分隔的后缀列表，不区分大小写，可以带前导的点
    pub fn new(root: impl Into<PathBuf>, suffix: &str) -> Result<Self> {
        let exts = suffix
            .split(',')
            .map(|s| s.trim().trim_start_matches('.'))
            .filter(|s| !s.is_empty())
            .map(regex::escape)
            .collect::<Vec<_>>();
        ensure!(!exts.is_empty(), "后缀列表为空");
        let suffix = Regex::new(&format!("(?i)^({})$", exts.join("|")))?;
        Ok(Self { root: root.into(), suffix })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 文件后缀是否匹配
    pub fn matches(&self, path: &Path) -> bool {
        path.extension().is_some_and(|ext| self.suffix.is_match(&ext.to_string_lossy()))
    }

    /// 开始扫描，边扫描边产生文件路径
    ///
    /// 跟随符号链接；根目录无法打开时返回错误，子目录中的错误只会被跳过
    pub fn walk(&self) -> Result<impl Iterator<Item = PathBuf> + '_> {
        fs::metadata(&self.root)
            .with_context(|| format!("无法打开目录 '{}'", self.root.display()))?;
        info!("开始扫描目录: {}", self.root.display());

        Ok(WalkDir::new(&self.root)
            .follow_links(true)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("跳过: {}", e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file() && self.matches(entry.path()))
            .map(|entry| entry.into_path()))
    }
}
