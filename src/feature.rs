use std::path::Path;

use anyhow::Result;
use bytemuck::{Pod, Zeroable};

/// 描述符维数，与 SIFT 一致
pub const DESCR_LEN: usize = 128;

/// 单个局部特征
///
/// 固定布局，可以直接按字节写入打包记录，管线内部不解读描述符内容
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Feature {
    /// 特征点横坐标
    pub x: f32,
    /// 特征点纵坐标
    pub y: f32,
    /// 特征尺度
    pub scale: f32,
    /// 主方向（弧度）
    pub orientation: f32,
    /// 描述符
    pub descr: [f32; DESCR_LEN],
}

impl Feature {
    /// 只有描述符的特征，主要用于测试和合成数据
    pub fn from_descr(descr: [f32; DESCR_LEN]) -> Self {
        Self { x: 0., y: 0., scale: 0., orientation: 0., descr }
    }

    /// 两个描述符之间的欧氏距离平方
    #[inline]
    pub fn descr_dist_sq(&self, other: &Feature) -> f32 {
        self.descr.iter().zip(other.descr.iter()).map(|(a, b)| (a - b) * (a - b)).sum()
    }
}

/// 特征提取器
///
/// 返回空列表表示图片中没有找到特征点，解码失败等情况返回错误
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<Vec<Feature>>;
}
