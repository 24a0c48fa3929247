//! Face localization
//!
//! [`FaceLocalizer`] is the seam the orchestrator consumes: an image in the
//! localizer's channel order goes in, a ranked list of boxes comes out. Only
//! the first box is ever used, so the ranking is the localizer's business.
//!
//! [`ScrfdLocalizer`] is the production implementation, an InsightFace SCRFD
//! model on OpenVINO.

use std::path::Path;

use image::{imageops, ImageBuffer, Rgb, RgbImage};
use ndarray::Array4;
use openvino::{ElementType, InferRequest, Shape, Tensor};
use serde::{Deserialize, Serialize};
use anyhow::Result;

use super::runtime::{OpenVinoRuntime, SafeCompiledModel};

/// Detector input resolution
pub const DETECTOR_INPUT_SIZE: (u32, u32) = (640, 640);

/// Axis-aligned face rectangle in integer pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "[i32; 4]", from = "[i32; 4]")]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Clamp into `[0, width] x [0, height]`. The result may be empty.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let w = i32::try_from(width).unwrap_or(i32::MAX);
        let h = i32::try_from(height).unwrap_or(i32::MAX);
        Self {
            x1: self.x1.clamp(0, w),
            y1: self.y1.clamp(0, h),
            x2: self.x2.clamp(0, w),
            y2: self.y2.clamp(0, h),
        }
    }

    /// Zero when the box is empty or inverted
    pub fn width(&self) -> u32 {
        (self.x2 - self.x1).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.y2 - self.y1).max(0) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

impl From<BoundingBox> for [i32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

impl From<[i32; 4]> for BoundingBox {
    fn from(a: [i32; 4]) -> Self {
        Self::new(a[0], a[1], a[2], a[3])
    }
}

/// Per-pixel component order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

/// 3-channel pixels tagged with the order their components are stored in
#[derive(Debug, Clone)]
pub struct OrderedImage {
    order: ChannelOrder,
    pixels: RgbImage,
}

impl OrderedImage {
    /// Copy an RGB image into `order`
    pub fn from_rgb(rgb: &RgbImage, order: ChannelOrder) -> Self {
        let pixels = match order {
            ChannelOrder::Rgb => rgb.clone(),
            ChannelOrder::Bgr => ImageBuffer::from_fn(rgb.width(), rgb.height(), |x, y| {
                let [r, g, b] = rgb.get_pixel(x, y).0;
                Rgb([b, g, r])
            }),
        };
        Self { order, pixels }
    }

    pub fn order(&self) -> ChannelOrder {
        self.order
    }

    /// Raw buffer; component order is [`order`](Self::order)
    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }
}

/// Returns candidate face boxes, best first
pub trait FaceLocalizer: Send + Sync {
    /// Channel order `detect` expects
    fn channel_order(&self) -> ChannelOrder;

    fn detect(&self, image: &OrderedImage) -> Result<Vec<BoundingBox>>;
}

/// Detection with sub-pixel coordinates, before ranking and rounding
#[derive(Debug, Clone)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    confidence: f32,
}

/// Letterbox geometry used to map detections back to the source image
struct ResizeInfo {
    scale: f32,
    offset_x: u32,
    offset_y: u32,
    scaled_width: u32,
    scaled_height: u32,
    original_width: u32,
    original_height: u32,
}

impl ResizeInfo {
    fn new(original: (u32, u32), target: (u32, u32)) -> Self {
        let (orig_w, orig_h) = original;
        let (target_w, target_h) = target;

        let scale = f32::min(
            target_w as f32 / orig_w as f32,
            target_h as f32 / orig_h as f32,
        );

        let new_w = ((orig_w as f32 * scale) as u32).clamp(1, target_w);
        let new_h = ((orig_h as f32 * scale) as u32).clamp(1, target_h);

        Self {
            scale,
            offset_x: (target_w - new_w) / 2,
            offset_y: (target_h - new_h) / 2,
            scaled_width: new_w,
            scaled_height: new_h,
            original_width: orig_w,
            original_height: orig_h,
        }
    }

    fn scaled_size(&self) -> (u32, u32) {
        (self.scaled_width, self.scaled_height)
    }

    /// Convert detection coordinates back to original image space
    fn to_original(&self, x: f32, y: f32) -> (f32, f32) {
        let x = (x - self.offset_x as f32) / self.scale;
        let y = (y - self.offset_y as f32) / self.scale;
        (x, y)
    }
}

/// Letterbox into the detector input and normalize to roughly [-1, 1],
/// keeping the image's own channel order.
fn letterbox_nchw(pixels: &RgbImage, info: &ResizeInfo) -> Array4<f32> {
    let (target_w, target_h) = DETECTOR_INPUT_SIZE;
    let (new_w, new_h) = info.scaled_size();
    let resized = imageops::resize(pixels, new_w, new_h, imageops::FilterType::Triangle);

    // padding is black, which normalizes to (0 - 127.5) / 128
    let mut tensor = Array4::<f32>::from_elem(
        (1, 3, target_h as usize, target_w as usize),
        -127.5 / 128.0,
    );

    for (x, y, pixel) in resized.enumerate_pixels() {
        let tx = (x + info.offset_x) as usize;
        let ty = (y + info.offset_y) as usize;
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - 127.5) / 128.0;
        }
    }

    tensor
}

/// SCRFD face detector
pub struct ScrfdLocalizer {
    model: SafeCompiledModel,
    confidence_threshold: f32,
    nms_threshold: f32,
}

impl ScrfdLocalizer {
    /// Compile the detector model; called once at startup
    pub fn load(runtime: &OpenVinoRuntime, path: &Path, confidence_threshold: f32) -> Result<Self> {
        let model = runtime.compile(path)?;
        Ok(Self {
            model,
            confidence_threshold,
            nms_threshold: 0.4,
        })
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }

    fn run(&self, input_tensor: &Array4<f32>) -> Result<InferRequest> {
        let mut request = self.model.create_infer_request()?;

        let (w, h) = DETECTOR_INPUT_SIZE;
        let input_shape = Shape::new(&[1, 3, h as i64, w as i64])?;
        let mut input = Tensor::new(ElementType::F32, &input_shape)?;

        let input_data = input_tensor
            .as_slice()
            .ok_or_else(|| anyhow::anyhow!("detector input is not contiguous"))?;
        unsafe {
            let tensor_data = input.get_raw_data_mut()?.as_mut_ptr() as *mut f32;
            std::ptr::copy_nonoverlapping(input_data.as_ptr(), tensor_data, input_data.len());
        }

        request.set_input_tensor(&input)?;
        request.infer()?;
        Ok(request)
    }

    /// Decode SCRFD stride outputs.
    ///
    /// Output layout depends on the export: 6 (3 strides, boxes), 9 (3 strides,
    /// boxes and keypoints), 10 or 15 (5 strides). Scores come first, then box
    /// distances; keypoints are not needed here.
    fn parse_outputs(&self, request: &InferRequest, resize_info: &ResizeInfo) -> Result<Vec<Candidate>> {
        let mut output_count = 0;
        for i in 0..20 {
            if request.get_output_tensor_by_index(i).is_ok() {
                output_count += 1;
            } else {
                break;
            }
        }

        let (fmc, num_anchors) = match output_count {
            6 | 9 => (3, 2),
            10 | 15 => (5, 1),
            _ => {
                tracing::warn!("Unknown SCRFD output count: {}, trying default", output_count);
                (3, 2)
            }
        };

        let strides: &[i32] = if fmc == 3 { &[8, 16, 32] } else { &[8, 16, 32, 64, 128] };
        let (input_w, input_h) = (DETECTOR_INPUT_SIZE.0 as i32, DETECTOR_INPUT_SIZE.1 as i32);
        let (max_x, max_y) = (
            resize_info.original_width as f32,
            resize_info.original_height as f32,
        );

        let mut candidates = Vec::new();

        for (idx, &stride) in strides.iter().enumerate() {
            let scores = read_tensor_f32(&request.get_output_tensor_by_index(idx)?)?;
            let bboxes = read_tensor_f32(&request.get_output_tensor_by_index(idx + fmc)?)?;

            let feat_h = input_h / stride;
            let feat_w = input_w / stride;
            let s = stride as f32;

            let anchors = (0..feat_h)
                .flat_map(|y| (0..feat_w).map(move |x| (x as f32 * s, y as f32 * s)))
                .flat_map(|center| std::iter::repeat(center).take(num_anchors));

            for (i, (cx, cy)) in anchors.enumerate() {
                let Some(&score) = scores.get(i) else { break };
                if score < self.confidence_threshold {
                    continue;
                }

                let b = i * 4;
                if b + 3 >= bboxes.len() {
                    break;
                }

                let (x1, y1) = resize_info.to_original(cx - bboxes[b] * s, cy - bboxes[b + 1] * s);
                let (x2, y2) = resize_info.to_original(cx + bboxes[b + 2] * s, cy + bboxes[b + 3] * s);

                candidates.push(Candidate {
                    x1: x1.clamp(0.0, max_x),
                    y1: y1.clamp(0.0, max_y),
                    x2: x2.clamp(0.0, max_x),
                    y2: y2.clamp(0.0, max_y),
                    confidence: score,
                });
            }
        }

        tracing::debug!("{} faces before NMS", candidates.len());
        Ok(candidates)
    }
}

impl FaceLocalizer for ScrfdLocalizer {
    fn channel_order(&self) -> ChannelOrder {
        // InsightFace models are trained on BGR input
        ChannelOrder::Bgr
    }

    fn detect(&self, image: &OrderedImage) -> Result<Vec<BoundingBox>> {
        if image.order() != self.channel_order() {
            anyhow::bail!("SCRFD expects {:?} input, got {:?}", self.channel_order(), image.order());
        }

        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }

        let resize_info = ResizeInfo::new((width, height), DETECTOR_INPUT_SIZE);
        let input = letterbox_nchw(image.pixels(), &resize_info);
        let request = self.run(&input)?;
        let candidates = self.parse_outputs(&request, &resize_info)?;
        let kept = nms(candidates, self.nms_threshold);

        tracing::debug!("Detected {} faces after NMS", kept.len());

        Ok(kept
            .into_iter()
            .map(|c| BoundingBox::new(c.x1 as i32, c.y1 as i32, c.x2 as i32, c.y2 as i32))
            .collect())
    }
}

/// Read tensor data as f32 vector
fn read_tensor_f32(tensor: &Tensor) -> Result<Vec<f32>> {
    let shape = tensor.get_shape()?;
    let total_elements: i64 = shape.get_dimensions().iter().product();

    let data: Vec<f32> = unsafe {
        let ptr = tensor.get_raw_data()?.as_ptr() as *const f32;
        std::slice::from_raw_parts(ptr, total_elements as usize).to_vec()
    };

    Ok(data)
}

/// Non-maximum suppression; output is sorted by descending confidence
fn nms(mut boxes: Vec<Candidate>, threshold: f32) -> Vec<Candidate> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Candidate> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|k| iou(k, &candidate) <= threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Compute intersection over union
fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
    let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);
    let union = area_a + area_b - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}
