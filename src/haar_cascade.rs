use anyhow::{Context, Result};
use image::GrayImage;
use opencv::core::{Mat, Rect, Size, Vector};
use opencv::objdetect::{self, CascadeClassifier};
use opencv::prelude::*;
use std::path::Path;

use crate::face_detection::{DetectionParams, FaceDetector};
use crate::metadata::FaceBox;

/// 基于 OpenCV Haar 级联分类器的正脸检测器
pub struct HaarCascadeDetector {
    classifier: CascadeClassifier,
    params: DetectionParams,
}

impl HaarCascadeDetector {
    /// 从级联模型 XML 文件加载，例如 `haarcascade_frontalface_alt.xml`
    pub fn from_file(cascade_path: impl AsRef<Path>, params: DetectionParams) -> Result<Self> {
        let cascade_path = cascade_path.as_ref();
        if !cascade_path.exists() {
            anyhow::bail!("级联模型文件不存在: {}", cascade_path.display());
        }

        let classifier = CascadeClassifier::new(&cascade_path.to_string_lossy())
            .with_context(|| format!("加载级联模型失败: {}", cascade_path.display()))?;
        if classifier.empty().context("检查级联模型失败")? {
            anyhow::bail!("级联模型为空: {}", cascade_path.display());
        }

        Ok(Self { classifier, params })
    }
}

impl FaceDetector for HaarCascadeDetector {
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<FaceBox>> {
        let (width, height) = image.dimensions();
        let gray = Mat::new_rows_cols_with_data(height as i32, width as i32, image.as_raw())
            .context("灰度图转换为 Mat 失败")?
            .try_clone()
            .context("复制 Mat 失败")?;

        let mut rects = Vector::<Rect>::new();
        let min_size = self.params.min_size as i32;
        self.classifier
            .detect_multi_scale(
                &gray,
                &mut rects,
                self.params.scale_factor,
                self.params.min_neighbors,
                objdetect::CASCADE_SCALE_IMAGE,
                Size::new(min_size, min_size),
                Size::new(0, 0),
            )
            .context("人脸检测失败")?;

        Ok(rects
            .iter()
            .map(|r| FaceBox::clamped(r.x, r.y, r.width, r.height, width, height))
            .collect())
    }
}
