use serde::{Deserialize, Serialize};

/// 静音区间（秒），序列化为 `[start, end]` 二元数组
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SilenceInterval(pub f64, pub f64);

impl SilenceInterval {
    pub fn start(&self) -> f64 {
        self.0
    }

    pub fn end(&self) -> f64 {
        self.1
    }

    pub fn duration(&self) -> f64 {
        self.1 - self.0
    }
}

/// 单个人脸的边界框（像素坐标）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceBox {
    /// 将检测器输出的矩形裁剪到图像范围内，负坐标归零
    pub fn clamped(x: i32, y: i32, width: i32, height: i32, image_width: u32, image_height: u32) -> Self {
        let x = x.max(0) as u32;
        let y = y.max(0) as u32;
        let x = x.min(image_width);
        let y = y.min(image_height);
        let width = (width.max(0) as u32).min(image_width - x);
        let height = (height.max(0) as u32).min(image_height - y);
        Self { x, y, width, height }
    }
}

/// 单张图片的人脸检测结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageFaces {
    /// 图片文件名
    pub image_frame: String,
    /// 检测到的人脸数量
    pub num_faces: usize,
    /// 人脸边界框列表
    pub faces: Vec<FaceBox>,
}

impl ImageFaces {
    pub fn new(image_frame: impl Into<String>, faces: Vec<FaceBox>) -> Self {
        Self {
            image_frame: image_frame.into(),
            num_faces: faces.len(),
            faces,
        }
    }
}

/// 整个目录的检测报告，按目录遍历顺序排列
pub type DetectionReport = Vec<ImageFaces>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_interval_serializes_as_pair() {
        let json = serde_json::to_string(&vec![SilenceInterval(0.0, 2.0)]).unwrap();
        assert_eq!(json, "[[0.0,2.0]]");
    }

    #[test]
    fn test_image_faces_field_names() {
        let record = ImageFaces::new(
            "frame_0000.jpg",
            vec![FaceBox { x: 1, y: 2, width: 30, height: 40 }],
        );
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["image_frame"], "frame_0000.jpg");
        assert_eq!(value["num_faces"], 1);
        assert_eq!(value["faces"][0]["width"], 30);
        assert_eq!(value["faces"][0]["height"], 40);
    }

    #[test]
    fn test_face_box_clamped_to_image() {
        let face = FaceBox::clamped(-5, 10, 50, 100, 40, 60);
        assert_eq!(face, FaceBox { x: 0, y: 10, width: 40, height: 50 });
    }
}
