use candle_core::{DType, Result, Tensor};
use ndarray::Array4;

/// Bilinear resize (`align_corners = false`) of a `[batch, channel, height, width]` tensor.
///
/// Runs on the host through ndarray; the result is placed back on the input's device.
pub fn bilinear_interpolate_tensor(input: &Tensor, output_h: usize, output_w: usize) -> Result<Tensor> {
    let (batch, channels, in_h, in_w) = input.dims4()?;
    if (in_h, in_w) == (output_h, output_w) {
        return Ok(input.clone());
    }

    let input_vec = input
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    let input_array =
        Array4::from_shape_vec((batch, channels, in_h, in_w), input_vec).map_err(|e| {
            candle_core::Error::Msg(format!("failed to view tensor as Array4<f32>: {e}"))
        })?;

    let output_array = bilinear_interpolate(&input_array, output_h, output_w);
    let (data, _) = output_array.into_raw_vec_and_offset();

    Tensor::from_vec(data, (batch, channels, output_h, output_w), input.device())
}

pub fn bilinear_interpolate(input: &Array4<f32>, output_h: usize, output_w: usize) -> Array4<f32> {
    let (batch, channels, in_h, in_w) = input.dim();
    let mut output = Array4::<f32>::zeros((batch, channels, output_h, output_w));
    if in_h == 0 || in_w == 0 {
        return output;
    }
    let scale_h = in_h as f32 / output_h as f32;
    let scale_w = in_w as f32 / output_w as f32;
    output.indexed_iter_mut().for_each(|((b, c, y, x), val)| {
        let y_in = ((y as f32 + 0.5) * scale_h - 0.5).clamp(0.0, (in_h - 1) as f32);
        let x_in = ((x as f32 + 0.5) * scale_w - 0.5).clamp(0.0, (in_w - 1) as f32);

        let y0 = y_in.floor() as usize;
        let x0 = x_in.floor() as usize;
        let y1 = (y0 + 1).min(in_h - 1);
        let x1 = (x0 + 1).min(in_w - 1);
        let dy = y_in - y0 as f32;
        let dx = x_in - x0 as f32;

        let f00 = input[[b, c, y0, x0]];
        let f01 = input[[b, c, y0, x1]];
        let f10 = input[[b, c, y1, x0]];
        let f11 = input[[b, c, y1, x1]];
        *val = (1.0 - dx) * (1.0 - dy) * f00
            + dx * (1.0 - dy) * f01
            + (1.0 - dx) * dy * f10
            + dx * dy * f11;
    });
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_same_size_is_identity() -> Result<()> {
        let t = Tensor::randn(0f32, 1.0, (1, 2, 4, 3), &Device::Cpu)?;
        let out = bilinear_interpolate_tensor(&t, 4, 3)?;
        assert_eq!(out.dims(), t.dims());
        Ok(())
    }

    #[test]
    fn test_upsample_constant_stays_constant() {
        let input = Array4::<f32>::from_elem((1, 1, 2, 2), 3.5);
        let out = bilinear_interpolate(&input, 5, 7);
        assert!(out.iter().all(|v| (*v - 3.5).abs() < 1e-6));
    }

    #[test]
    fn test_upsample_two_pixels() {
        // torch: F.interpolate([[0, 1]], size=4, mode="bilinear") -> [0, .25, .75, 1]
        let input = Array4::from_shape_vec((1, 1, 1, 2), vec![0.0f32, 1.0]).unwrap();
        let out = bilinear_interpolate(&input, 1, 4);
        let vals: Vec<f32> = out.iter().copied().collect();
        let expected = [0.0, 0.25, 0.75, 1.0];
        for (v, e) in vals.iter().zip(expected) {
            assert!((v - e).abs() < 1e-6, "{vals:?}");
        }
    }

    #[test]
    fn test_downsample_shape() -> Result<()> {
        let t = Tensor::randn(0f32, 1.0, (3, 2, 8, 8), &Device::Cpu)?;
        assert_eq!(bilinear_interpolate_tensor(&t, 4, 2)?.dims(), &[3, 2, 4, 2]);
        Ok(())
    }
}
