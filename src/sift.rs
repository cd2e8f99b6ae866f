//! 基于 OpenCV 的 SIFT 特征提取
//!
//! 需要启用 `opencv` 特性，否则所有图片都会提取失败

use std::path::Path;

use anyhow::Result;

use crate::feature::{Feature, FeatureExtractor};

/// 图片最长边的上限，超出时等比缩小
pub const MAX_IMAGE_SIZE: i32 = 800;
/// 对比度阈值，较保守的取值
pub const SIFT_CONTR_THR: f64 = 0.1;
/// 每组的层数
pub const SIFT_INTVLS: i32 = 3;
/// 边缘响应阈值
pub const SIFT_CURV_THR: f64 = 10.;
pub const SIFT_SIGMA: f64 = 1.6;

#[derive(Debug, Clone, Copy)]
pub struct SiftExtractor {
    pub max_size: i32,
}

impl Default for SiftExtractor {
    fn default() -> Self {
        Self { max_size: MAX_IMAGE_SIZE }
    }
}

#[cfg(feature = "opencv")]
mod imp {
    use std::cell::RefCell;
    use std::path::Path;

    use anyhow::{Context, Result, ensure};
    use opencv::core::{Mat, Ptr, Size, Vector};
    use opencv::features2d::SIFT;
    use opencv::prelude::*;
    use opencv::{imgcodecs, imgproc};

    use crate::feature::{DESCR_LEN, Feature};

    thread_local! {
        // 每个工作线程持有自己的检测器
        static DETECTOR: RefCell<Option<Ptr<SIFT>>> = const { RefCell::new(None) };
    }

    /// 以灰度读取图片，最长边超过 `max_size` 时等比缩小
    pub fn imread(path: &Path, max_size: i32) -> Result<Mat> {
        let filename = path.to_str().context("路径不是有效的 UTF-8")?;
        let img = imgcodecs::imread(filename, imgcodecs::IMREAD_GRAYSCALE)?;
        ensure!(!img.empty(), "无法解码图片");

        let (w, h) = (img.cols(), img.rows());
        if w.max(h) <= max_size {
            return Ok(img);
        }
        let scale = max_size as f64 / w.max(h) as f64;
        let mut output = Mat::default();
        imgproc::resize(
            &img,
            &mut output,
            Size::default(),
            scale,
            scale,
            imgproc::InterpolationFlags::INTER_AREA as i32,
        )?;
        Ok(output)
    }

    pub fn detect(image: &Mat) -> Result<Vec<Feature>> {
        DETECTOR.with(|cell| {
            let mut detector = match cell.borrow_mut().take() {
                Some(detector) => detector,
                None => SIFT::create(
                    0,
                    super::SIFT_INTVLS,
                    super::SIFT_CONTR_THR,
                    super::SIFT_CURV_THR,
                    super::SIFT_SIGMA,
                    false,
                )?,
            };
            let result = detect_with(&mut detector, image);
            *cell.borrow_mut() = Some(detector);
            result
        })
    }

    fn detect_with(detector: &mut Ptr<SIFT>, image: &Mat) -> Result<Vec<Feature>> {
        let mut keypoints = Vector::new();
        let mut descriptors = Mat::default();
        detector.detect_and_compute(
            image,
            &Mat::default(),
            &mut keypoints,
            &mut descriptors,
            false,
        )?;

        let mut features = Vec::with_capacity(keypoints.len());
        for (i, kp) in keypoints.iter().enumerate() {
            let row = descriptors.at_row::<f32>(i as i32)?;
            ensure!(row.len() == DESCR_LEN, "描述符长度为 {}", row.len());
            let mut descr = [0f32; DESCR_LEN];
            descr.copy_from_slice(row);
            let pt = kp.pt();
            features.push(Feature {
                x: pt.x,
                y: pt.y,
                scale: kp.size(),
                orientation: kp.angle().to_radians(),
                descr,
            });
        }
        Ok(features)
    }
}

#[cfg(feature = "opencv")]
impl FeatureExtractor for SiftExtractor {
    fn extract(&self, path: &Path) -> Result<Vec<Feature>> {
        use anyhow::Context;

        let image = imp::imread(path, self.max_size)
            .with_context(|| format!("读取图片失败: {}", path.display()))?;
        imp::detect(&image)
    }
}

#[cfg(not(feature = "opencv"))]
impl FeatureExtractor for SiftExtractor {
    fn extract(&self, path: &Path) -> Result<Vec<Feature>> {
        anyhow::bail!("无法处理 {}: 编译时未启用 opencv 特性", path.display())
    }
}
