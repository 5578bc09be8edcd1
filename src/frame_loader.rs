use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Result, Tensor};
use image::{DynamicImage, GenericImageView};

/// Source of raw video frames, each returned as a (3, height, width) f32 tensor in [0, 255].
pub trait FrameLoader {
    fn get_frame(&self, index: usize, device: &Device) -> Result<Tensor>;
    /// (height, width) shared by every frame.
    fn frame_size(&self) -> (usize, usize);
    fn total_frames(&self) -> usize;

    fn load_clip(&self, device: &Device) -> Result<Vec<Tensor>> {
        (0..self.total_frames())
            .map(|i| self.get_frame(i, device))
            .collect()
    }
}

fn image_to_tensor(img: &DynamicImage, device: &Device) -> Result<Tensor> {
    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    let data = rgb.into_raw();
    Tensor::from_vec(data, (height as usize, width as usize, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)
}

/// Frames stored as individual image files in one folder, ordered by file name.
pub struct ImageLoader {
    image_paths: Vec<PathBuf>,
    base_dimensions: (u32, u32),
}

impl ImageLoader {
    pub fn new<P: AsRef<Path>>(folder_path: P) -> Result<Self> {
        let supported_extensions = ["jpg", "jpeg", "png", "bmp", "webp"];

        let entries = std::fs::read_dir(folder_path)
            .map_err(|e| candle_core::Error::wrap(format!("read dir fail: {e}")))?;

        let mut image_paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| candle_core::Error::wrap(format!("item error: {e}")))?;
            let path = entry.path();
            let supported = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|ext| supported_extensions.contains(&ext.to_lowercase().as_str()))
                .unwrap_or(false);
            if path.is_file() && supported {
                image_paths.push(path);
            }
        }

        if image_paths.is_empty() {
            return Err(candle_core::Error::msg("no image found"));
        }
        image_paths.sort();

        let first_img = image::open(&image_paths[0])
            .map_err(|e| candle_core::Error::wrap(format!("load first frame fail: {e}")))?;
        let base_dimensions = first_img.dimensions();
        tracing::debug!(frames = image_paths.len(), ?base_dimensions, "indexed frame folder");

        Ok(Self {
            image_paths,
            base_dimensions,
        })
    }

    pub fn len(&self) -> usize {
        self.image_paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_paths.is_empty()
    }
}

impl FrameLoader for ImageLoader {
    fn get_frame(&self, index: usize, device: &Device) -> Result<Tensor> {
        let path = self.image_paths.get(index).ok_or_else(|| {
            candle_core::Error::msg(format!("index {index} out of bound (total: {})", self.len()))
        })?;

        let img = image::open(path)
            .map_err(|e| candle_core::Error::wrap(format!("frame load fail: {e}")))?;

        let current_dims = img.dimensions();
        if current_dims != self.base_dimensions {
            return Err(candle_core::Error::msg(format!(
                "frame size does not match first frame: {:?} != {:?}",
                current_dims, self.base_dimensions
            )));
        }

        image_to_tensor(&img, device)
    }

    fn frame_size(&self) -> (usize, usize) {
        (
            self.base_dimensions.1 as usize,
            self.base_dimensions.0 as usize,
        )
    }

    fn total_frames(&self) -> usize {
        self.len()
    }
}

/// Frames pre-decoded into a safetensors file: `images` (time, 3, h, w).
pub struct ImageTensorLoader {
    images: Tensor,
}

impl ImageTensorLoader {
    pub fn new<P: AsRef<Path>>(safetensors_path: P, device: &Device) -> Result<Self> {
        let tensors = candle_core::safetensors::load(safetensors_path, device)?;
        let images = tensors
            .get("images")
            .ok_or_else(|| candle_core::Error::msg("missing `images` tensor"))?
            .to_dtype(DType::F32)?;
        images.dims4()?;
        Ok(Self { images })
    }

    pub fn from_tensor(images: Tensor) -> Result<Self> {
        images.dims4()?;
        Ok(Self { images })
    }
}

impl FrameLoader for ImageTensorLoader {
    fn get_frame(&self, index: usize, device: &Device) -> Result<Tensor> {
        self.images.get(index)?.to_device(device)
    }

    fn frame_size(&self) -> (usize, usize) {
        let dims = self.images.dims();
        (dims[2], dims[3])
    }

    fn total_frames(&self) -> usize {
        self.images.dims()[0]
    }
}

/// (x - mean) / std per channel for a (3, h, w) frame.
pub fn normalize_frame(frame: &Tensor, mean: &[f32; 3], std: &[f32; 3]) -> Result<Tensor> {
    let device = frame.device();
    let mean = Tensor::new(mean.as_slice(), device)?.reshape((3, 1, 1))?;
    let std = Tensor::new(std.as_slice(), device)?.reshape((3, 1, 1))?;
    frame
        .to_dtype(DType::F32)?
        .broadcast_sub(&mean)?
        .broadcast_div(&std)
}

/// Frames of different sizes zero-padded into one batch.
#[derive(Debug, Clone)]
pub struct ImageList {
    /// (frames, channels, padded_h, padded_w)
    pub tensor: Tensor,
    /// Unpadded (height, width) per frame.
    pub image_sizes: Vec<(usize, usize)>,
}

impl ImageList {
    pub fn from_tensors(images: &[Tensor], size_divisibility: usize) -> Result<Self> {
        if images.is_empty() {
            return Err(candle_core::Error::msg("ImageList needs at least one frame"));
        }
        let image_sizes = images
            .iter()
            .map(|img| {
                let (_, h, w) = img.dims3()?;
                Ok((h, w))
            })
            .collect::<Result<Vec<_>>>()?;

        let round_up = |v: usize| match size_divisibility {
            0 | 1 => v,
            d => v.div_ceil(d) * d,
        };
        let max_h = round_up(image_sizes.iter().map(|s| s.0).max().unwrap_or(0));
        let max_w = round_up(image_sizes.iter().map(|s| s.1).max().unwrap_or(0));

        let padded = images
            .iter()
            .zip(image_sizes.iter())
            .map(|(img, &(h, w))| {
                img.pad_with_zeros(1, 0, max_h - h)?
                    .pad_with_zeros(2, 0, max_w - w)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            tensor: Tensor::stack(&padded, 0)?,
            image_sizes,
        })
    }

    pub fn padded_size(&self) -> (usize, usize) {
        let dims = self.tensor.dims();
        (dims[2], dims[3])
    }

    pub fn len(&self) -> usize {
        self.image_sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_sizes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_list_pads_to_divisibility() -> Result<()> {
        let dev = Device::Cpu;
        let a = Tensor::ones((3, 30, 20), DType::F32, &dev)?;
        let b = Tensor::ones((3, 10, 40), DType::F32, &dev)?;
        let list = ImageList::from_tensors(&[a, b], 32)?;
        assert_eq!(list.tensor.dims(), &[2, 3, 32, 64]);
        assert_eq!(list.image_sizes, vec![(30, 20), (10, 40)]);
        assert_eq!(list.padded_size(), (32, 64));

        // padding is zero, content is kept
        let first = list.tensor.get(0)?;
        let inside = first.narrow(1, 0, 30)?.narrow(2, 0, 20)?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(inside, 3.0 * 30.0 * 20.0);
        assert_eq!(first.sum_all()?.to_scalar::<f32>()?, inside);
        Ok(())
    }

    #[test]
    fn test_normalize_frame() -> Result<()> {
        let frame = Tensor::full(10f32, (3, 2, 2), &Device::Cpu)?;
        let out = normalize_frame(&frame, &[10.0, 8.0, 0.0], &[1.0, 2.0, 5.0])?;
        let vals = out.to_vec3::<f32>()?;
        assert_eq!(vals[0][0][0], 0.0);
        assert_eq!(vals[1][1][1], 1.0);
        assert_eq!(vals[2][0][1], 2.0);
        Ok(())
    }

    #[test]
    fn test_image_folder_loader() -> Result<()> {
        let dir = tempfile::tempdir().map_err(candle_core::Error::wrap)?;
        for i in 0..3 {
            let img = image::RgbImage::from_pixel(5, 4, image::Rgb([i * 10, 0, 255]));
            img.save(dir.path().join(format!("{i:05}.png")))
                .map_err(candle_core::Error::wrap)?;
        }
        std::fs::write(dir.path().join("notes.txt"), "skip me").map_err(candle_core::Error::wrap)?;

        let loader = ImageLoader::new(dir.path())?;
        assert_eq!(loader.total_frames(), 3);
        assert_eq!(loader.frame_size(), (4, 5));

        let frame = loader.get_frame(2, &Device::Cpu)?;
        assert_eq!(frame.dims(), &[3, 4, 5]);
        let vals = frame.to_vec3::<f32>()?;
        assert_eq!(vals[0][0][0], 20.0);
        assert_eq!(vals[2][3][4], 255.0);
        assert!(loader.get_frame(3, &Device::Cpu).is_err());
        Ok(())
    }

    #[test]
    fn test_tensor_loader() -> Result<()> {
        let images = Tensor::zeros((4, 3, 6, 7), DType::F32, &Device::Cpu)?;
        let loader = ImageTensorLoader::from_tensor(images)?;
        assert_eq!(loader.total_frames(), 4);
        assert_eq!(loader.frame_size(), (6, 7));
        assert_eq!(loader.load_clip(&Device::Cpu)?.len(), 4);
        Ok(())
    }
}
