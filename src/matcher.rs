use std::time::Instant;

use anyhow::{Result, ensure};
use log::{debug, warn};
use rayon::ThreadPool;
use rayon::prelude::*;
use serde::Serialize;

use crate::feature::Feature;
use crate::kdtree::bbf_knn;
use crate::packed::{self, Packed};
use crate::store::IndexStore;

/// 最近邻与次近邻距离平方之比的阈值
pub const NN_SQ_DIST_RATIO_THR: f32 = 0.49;
/// BBF 搜索最多检查的叶子数
pub const KDTREE_BBF_MAX_NN_CHKS: usize = 200;
/// 匹配百分比必须大于此值才会保留
pub const MIN_MATCH_PERCENT: u32 = 10;
/// 每批从数据库中读取的记录数
pub const DEFAULT_BATCH_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchParams {
    pub batch_size: usize,
    pub max_checks: usize,
    pub ratio: f32,
    pub min_percent: u32,
}

impl Default for MatchParams {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_checks: KDTREE_BBF_MAX_NN_CHKS,
            ratio: NN_SQ_DIST_RATIO_THR,
            min_percent: MIN_MATCH_PERCENT,
        }
    }
}

/// 一条匹配结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Match {
    pub path: String,
    /// 查询图片的特征点数
    pub query_features: usize,
    /// 通过比值测试的特征点数
    pub matched: usize,
    /// `matched * 100 / query_features`，向下取整
    pub percent: u32,
}

/// 比值测试，等于阈值时不算匹配
pub fn passes_ratio_test(d0: f32, d1: f32, ratio: f32) -> bool {
    d0 < d1 * ratio
}

/// 匹配百分比，向下取整
pub fn match_percent(matched: usize, total: usize) -> u32 {
    if total == 0 { 0 } else { (matched * 100 / total) as u32 }
}

/// 为每个查询特征寻找记录中可信的对应特征
///
/// 返回值与 `query` 一一对应，没有通过比值测试的位置为 `None`
pub fn correspondences(query: &[Feature], packed: &Packed, params: &MatchParams) -> Vec<Option<usize>> {
    query
        .iter()
        .map(|feature| {
            let nbrs = bbf_knn(packed, packed.features(), feature, 2, params.max_checks);
            match nbrs.as_slice() {
                [n0, n1] if passes_ratio_test(n0.distance, n1.distance, params.ratio) => {
                    Some(n0.index)
                }
                _ => None,
            }
        })
        .collect()
}

/// 对一条记录打分，返回匹配的特征点数
pub fn score_entry(query: &[Feature], packed: &Packed, params: &MatchParams) -> usize {
    correspondences(query, packed, params).iter().flatten().count()
}

fn score_record(path: &str, data: &[u8], query: &[Feature], params: &MatchParams) -> Option<Match> {
    let packed = match packed::unpack(data) {
        Ok(packed) => packed,
        Err(e) => {
            warn!("跳过损坏的记录 {}: {:#}", path, e);
            return None;
        }
    };
    let matched = score_entry(query, &packed, params);
    let percent = match_percent(matched, query.len());
    (percent > params.min_percent).then(|| Match {
        path: path.to_owned(),
        query_features: query.len(),
        matched,
        percent,
    })
}

/// 用查询特征扫描整个数据库
///
/// 在一个读事务中按批读取记录，每批在线程池中并行打分，处理完一批后再读取下一批。
/// 返回的结果没有排序
pub fn match_features(
    store: &IndexStore,
    query: &[Feature],
    params: &MatchParams,
    pool: &ThreadPool,
) -> Result<Vec<Match>> {
    ensure!(!query.is_empty(), "查询图片没有特征点");
    let batch_size = params.batch_size.max(1);

    let rtxn = store.read_txn()?;
    let mut iter = store.iter(&rtxn)?;
    let mut batch = Vec::with_capacity(batch_size);
    let mut matches = vec![];
    let mut total = 0;

    loop {
        let start = Instant::now();
        batch.clear();
        for item in iter.by_ref().take(batch_size) {
            batch.push(item?);
        }
        if batch.is_empty() {
            break;
        }
        total += batch.len();

        let found = pool.install(|| {
            batch
                .par_iter()
                .filter_map(|&(path, data)| score_record(path, data, query, params))
                .collect::<Vec<_>>()
        });
        debug!("批次 {} 条记录，匹配 {} 条，耗时 {:.2?}", batch.len(), found.len(), start.elapsed());
        matches.extend(found);
    }

    debug!("共扫描 {} 条记录", total);
    Ok(matches)
}

/// 按匹配百分比从低到高排序
pub fn rank(matches: &mut [Match]) {
    matches.sort_by_key(|m| m.percent);
}
