use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Linear, Module, VarBuilder};
use ndarray::Array3;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::model::{PatchPrediction, VolumetricModel};
use crate::TARGET_INFERENCE;

/// Compact fully-convolutional 3D network: a conv stem, two pooled
/// downsampling stages ending in the bottleneck feature maps, a
/// segmentation head (4x nearest upsampling back to patch resolution) and a
/// risk head (global average pool + small MLP). Both heads end in a sigmoid.
///
/// candle has no native 3D convolution, so `Conv3d` below expresses a cubic
/// kernel as a sum of per-depth-tap 2D convolutions; the decomposition is
/// exact and differentiable, which the activation-map generator relies on.
///
/// Inference-only: there is no train mode and no per-run state.
pub struct LungNet3d {
    stem: Conv3d,
    down1: Conv3d,
    down2: Conv3d,
    seg1: Conv3d,
    seg2: Conv3d,
    risk1: Linear,
    risk2: Linear,
    device: Device,
}

/// 3D convolution over a (channels, depth, rows, cols) tensor with a cubic
/// kernel and same-size padding (kernel edge must be odd or 1).
struct Conv3d {
    weight: Tensor,
    bias: Tensor,
    padding: usize,
}

impl Conv3d {
    fn new(vb: &VarBuilder, c_in: usize, c_out: usize, k: usize, name: &str) -> candle_core::Result<Self> {
        let weight = vb.get((c_out, c_in, k, k, k), &format!("{name}.weight"))?;
        let bias = vb.get(c_out, &format!("{name}.bias"))?;
        Ok(Self { weight, bias, padding: k / 2 })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let (_c_in, d, _h, _w) = xs.dims4()?;
        let k = self.weight.dim(2)?;
        let c_out = self.weight.dim(0)?;
        let pad = self.padding;

        let xs = if pad > 0 { xs.pad_with_zeros(1, pad, pad)? } else { xs.clone() };

        // One 2D convolution per depth tap of the cubic kernel; depth
        // becomes the conv2d batch axis, so every output depth position is
        // covered in a single call per tap.
        let tap = |kd: usize| -> candle_core::Result<Tensor> {
            let slab = xs.narrow(1, kd, d)?.transpose(0, 1)?.contiguous()?;
            let w_kd = self.weight.narrow(2, kd, 1)?.squeeze(2)?.contiguous()?;
            slab.conv2d(&w_kd, pad, 1, 1, 1)
        };

        let mut acc = tap(0)?;
        for kd in 1..k {
            acc = (acc + tap(kd)?)?;
        }

        let out = acc.transpose(0, 1)?.contiguous()?;
        out.broadcast_add(&self.bias.reshape((c_out, 1, 1, 1))?)
    }
}

/// 2x2x2 max pooling. Depth must be even.
fn max_pool3d_2(xs: &Tensor) -> candle_core::Result<Tensor> {
    let (c, d, h, w) = xs.dims4()?;
    let pooled = xs.contiguous()?.reshape((1, c * d, h, w))?.max_pool2d(2)?;
    let pooled = pooled.reshape((c, d / 2, 2, h / 2, w / 2))?;
    let even = pooled.narrow(2, 0, 1)?.squeeze(2)?;
    let odd = pooled.narrow(2, 1, 1)?.squeeze(2)?;
    even.maximum(&odd)
}

/// 2x nearest-neighbor upsampling along all three spatial axes.
fn upsample3d_2x(xs: &Tensor) -> candle_core::Result<Tensor> {
    let (c, d, h, w) = xs.dims4()?;
    let up = xs
        .contiguous()?
        .reshape((1, c * d, h, w))?
        .upsample_nearest2d(h * 2, w * 2)?
        .reshape((c, d, h * 2, w * 2))?;
    let up = up.unsqueeze(2)?;
    let up = Tensor::cat(&[&up, &up], 2)?;
    up.reshape((c, d * 2, h * 2, w * 2))
}

fn patch_to_tensor(patch: &Array3<f32>, device: &Device) -> candle_core::Result<Tensor> {
    let (d, h, w) = patch.dim();
    let data: Vec<f32> = patch.iter().copied().collect();
    Tensor::from_vec(data, (1, d, h, w), device)
}

fn tensor_to_array3(t: &Tensor) -> Result<Array3<f32>, PipelineError> {
    let (d, h, w) = t.dims3().map_err(PipelineError::from)?;
    let data = t
        .contiguous()
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(PipelineError::from)?;
    Array3::from_shape_vec((d, h, w), data)
        .map_err(|e| PipelineError::Inference(format!("bad tensor shape: {}", e)))
}

impl LungNet3d {
    pub fn new(vb: VarBuilder, device: Device) -> Result<Self, PipelineError> {
        let risk1 = Linear::new(vb.get((32, 64), "risk1.weight")?, Some(vb.get(32, "risk1.bias")?));
        let risk2 = Linear::new(vb.get((1, 32), "risk2.weight")?, Some(vb.get(1, "risk2.bias")?));
        Ok(Self {
            stem: Conv3d::new(&vb, 1, 16, 3, "stem")?,
            down1: Conv3d::new(&vb, 16, 32, 3, "down1")?,
            down2: Conv3d::new(&vb, 32, 64, 3, "down2")?,
            seg1: Conv3d::new(&vb, 64, 16, 3, "seg1")?,
            seg2: Conv3d::new(&vb, 16, 1, 1, "seg2")?,
            risk1,
            risk2,
            device,
        })
    }

    /// Load weights from the configured safetensors file. Missing weights
    /// fall back to a zeroed network with a loud warning, matching how the
    /// reference deployment behaved before its first model drop.
    pub fn load(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let device = Device::cuda_if_available(0)?;
        info!(target: TARGET_INFERENCE, "Model device: {:?}", device);

        let vb = if config.model_path.exists() {
            let vb = unsafe {
                VarBuilder::from_mmaped_safetensors(&[&config.model_path], DType::F32, &device)?
            };
            info!(target: TARGET_INFERENCE, "Loaded weights from {}", config.model_path.display());
            vb
        } else {
            warn!(target: TARGET_INFERENCE, "No model weights at {}; running with zeroed weights",
                config.model_path.display());
            VarBuilder::zeros(DType::F32, &device)
        };

        Self::new(vb, device)
    }

    /// Full forward pass, also returning the bottleneck feature maps for
    /// activation-map generation.
    fn forward_with_features(&self, xs: &Tensor) -> candle_core::Result<(Tensor, Tensor, Tensor)> {
        let x1 = self.stem.forward(xs)?.relu()?;
        let x2 = self.down1.forward(&max_pool3d_2(&x1)?)?.relu()?;
        let features = self.down2.forward(&max_pool3d_2(&x2)?)?.relu()?;

        let up = upsample3d_2x(&upsample3d_2x(&features)?)?;
        let seg = self.seg1.forward(&up)?.relu()?;
        let seg = self.seg2.forward(&seg)?;
        let mask = candle_nn::ops::sigmoid(&seg)?.squeeze(0)?;

        let pooled = features.mean(3)?.mean(2)?.mean(1)?;
        let hidden = self.risk1.forward(&pooled.unsqueeze(0)?)?.relu()?;
        let logit = self.risk2.forward(&hidden)?;
        let risk = candle_nn::ops::sigmoid(&logit)?.squeeze(1)?.squeeze(0)?;

        Ok((mask, risk, features))
    }
}

impl VolumetricModel for LungNet3d {
    fn predict(&self, patch: &Array3<f32>) -> Result<PatchPrediction, PipelineError> {
        let xs = patch_to_tensor(patch, &self.device)?;
        let (mask, risk, _features) = self.forward_with_features(&xs)?;
        Ok(PatchPrediction {
            mask: tensor_to_array3(&mask)?,
            risk: risk.to_scalar::<f32>()?,
        })
    }

    fn malignancy(&self, patch: &Array3<f32>) -> Result<f32, PipelineError> {
        let xs = patch_to_tensor(patch, &self.device)?;
        let (_mask, risk, _features) = self.forward_with_features(&xs)?;
        Ok(risk.to_scalar::<f32>()?)
    }

    fn activation_map(&self, patch: &Array3<f32>) -> Result<Array3<f32>, PipelineError> {
        // The input is a Var so the graph is tracked down to the feature
        // maps; backward from the risk scalar then yields their gradient.
        let input = Var::from_tensor(&patch_to_tensor(patch, &self.device)?)?;
        let (_mask, risk, features) = self.forward_with_features(input.as_tensor())?;

        let grads = risk.backward()?;
        let grad = grads
            .get(&features)
            .ok_or_else(|| PipelineError::Inference("no gradient recorded for feature maps".into()))?;

        let channel_weights = grad.mean(3)?.mean(2)?.mean(1)?;
        let c = channel_weights.dim(0)?;
        let cam = features
            .broadcast_mul(&channel_weights.reshape((c, 1, 1, 1))?)?
            .sum(0)?
            .relu()?;

        tensor_to_array3(&cam)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VolumetricModel;

    fn zeroed_net() -> LungNet3d {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        LungNet3d::new(vb, device).unwrap()
    }

    #[test]
    fn zeroed_weights_give_half_probabilities() {
        let net = zeroed_net();
        let patch = Array3::<f32>::zeros((8, 8, 8));

        let prediction = net.predict(&patch).unwrap();
        assert_eq!(prediction.mask.dim(), (8, 8, 8));
        assert!(prediction.mask.iter().all(|&v| (v - 0.5).abs() < 1e-6));
        assert!((prediction.risk - 0.5).abs() < 1e-6);
    }

    #[test]
    fn activation_map_has_bottleneck_resolution() {
        let net = zeroed_net();
        let patch = Array3::<f32>::from_elem((8, 8, 8), 0.3);

        let cam = net.activation_map(&patch).unwrap();
        assert_eq!(cam.dim(), (2, 2, 2));
        // ReLU clamp leaves nothing negative.
        assert!(cam.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn predictions_are_deterministic() {
        let net = zeroed_net();
        let patch = Array3::<f32>::from_elem((8, 8, 8), 0.7);

        let a = net.predict(&patch).unwrap();
        let b = net.predict(&patch).unwrap();
        assert_eq!(a.mask, b.mask);
        assert_eq!(a.risk, b.risk);
    }
}
