//! Pre-trained ResNet classifier on candle.
//!
//! ```text
//! input 3×224×224
//!   └─ stem    conv7×7/2, BN, ReLU, maxpool3×3/2
//!       └─ layer1..layer4   bottleneck stages (torchvision v1.5 layout)
//!           └─ layer4 output  <- tapped for localization
//!               └─ global average pool → fc → logits
//! ```
//!
//! Parameter names follow torchvision (`conv1`, `bn1`, `layer{n}.{i}.conv{k}`,
//! `layer{n}.{i}.downsample.{0,1}`, `fc`), so ImageNet checkpoints exported to safetensors load
//! as they are. Without a local file the ResNet-50 checkpoint is fetched from the Hugging Face hub.

use candle_core::{DType, Device as CandleDevice, IndexOp, Tensor, Var, D};
use candle_nn::{batch_norm, conv2d_no_bias, linear, BatchNorm, Conv2d, Conv2dConfig, Linear, VarBuilder};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::classifier::{check_input, to_vec_f32, Classifier, TapId};
use crate::config::Device;
use crate::error::{ForensicError, Result};

/// Hub repository holding torchvision's ImageNet ResNet-50 weights.
pub const DEFAULT_WEIGHTS_REPO: &str = "timm/resnet50.tv_in1k";
const WEIGHTS_FILE: &str = "model.safetensors";
const EXPANSION: usize = 4;
const BN_EPS: f64 = 1e-5;

/// Stage depths and widths of a bottleneck ResNet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResNetConfig {
    pub layers: [usize; 4],
    /// Channels of the stem and of the first stage's bottleneck.
    pub base_width: usize,
    pub num_classes: usize,
}

impl ResNetConfig {
    pub fn resnet50() -> Self {
        Self {
            layers: [3, 4, 6, 3],
            base_width: 64,
            num_classes: 1000,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.layers.iter().any(|&n| n == 0) || self.base_width == 0 || self.num_classes == 0 {
            return Err(ForensicError::Config(format!(
                "degenerate ResNet configuration {:?}",
                self
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct ConvBn {
    conv: Conv2d,
    bn: BatchNorm,
}

impl ConvBn {
    #[allow(clippy::too_many_arguments)]
    fn load(
        vb: &VarBuilder,
        conv: &str,
        bn: &str,
        c_in: usize,
        c_out: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
    ) -> candle_core::Result<Self> {
        let config = Conv2dConfig {
            padding,
            stride,
            ..Default::default()
        };
        Ok(Self {
            conv: conv2d_no_bias(c_in, c_out, kernel, config, vb.pp(conv))?,
            bn: batch_norm(c_out, BN_EPS, vb.pp(bn))?,
        })
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        x.apply(&self.conv)?.apply_t(&self.bn, false)
    }
}

#[derive(Debug, Clone)]
struct Bottleneck {
    reduce: ConvBn,
    spatial: ConvBn,
    expand: ConvBn,
    downsample: Option<ConvBn>,
}

impl Bottleneck {
    fn load(vb: VarBuilder, c_in: usize, width: usize, stride: usize) -> candle_core::Result<Self> {
        let c_out = width * EXPANSION;
        let downsample = if stride != 1 || c_in != c_out {
            let vb = vb.pp("downsample");
            Some(ConvBn::load(&vb, "0", "1", c_in, c_out, 1, stride, 0)?)
        } else {
            None
        };
        Ok(Self {
            reduce: ConvBn::load(&vb, "conv1", "bn1", c_in, width, 1, 1, 0)?,
            // v1.5: the stride sits on the 3×3 convolution
            spatial: ConvBn::load(&vb, "conv2", "bn2", width, width, 3, stride, 1)?,
            expand: ConvBn::load(&vb, "conv3", "bn3", width, c_out, 1, 1, 0)?,
            downsample,
        })
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let y = self.reduce.forward(x)?.relu()?;
        let y = self.spatial.forward(&y)?.relu()?;
        let y = self.expand.forward(&y)?;
        let shortcut = match &self.downsample {
            Some(ds) => ds.forward(x)?,
            None => x.clone(),
        };
        (y + shortcut)?.relu()
    }
}

#[derive(Debug, Clone)]
struct Backbone {
    stem: ConvBn,
    stages: Vec<Vec<Bottleneck>>,
    fc: Linear,
}

impl Backbone {
    fn load(vb: VarBuilder, config: &ResNetConfig) -> candle_core::Result<Self> {
        let stem = ConvBn::load(&vb, "conv1", "bn1", 3, config.base_width, 7, 2, 3)?;
        let mut c_in = config.base_width;
        let mut stages = Vec::with_capacity(config.layers.len());
        for (i, &depth) in config.layers.iter().enumerate() {
            let width = config.base_width << i;
            let stage_vb = vb.pp(format!("layer{}", i + 1));
            let mut blocks = Vec::with_capacity(depth);
            for b in 0..depth {
                let stride = if i > 0 && b == 0 { 2 } else { 1 };
                blocks.push(Bottleneck::load(stage_vb.pp(b), c_in, width, stride)?);
                c_in = width * EXPANSION;
            }
            stages.push(blocks);
        }
        let fc = linear(c_in, config.num_classes, vb.pp("fc"))?;
        Ok(Self { stem, stages, fc })
    }

    /// Output of the last bottleneck stage, `1×C×h×w`.
    fn features(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let x = self.stem.forward(x)?.relu()?;
        // A replicated edge never exceeds the row it copies, so this pools like -inf padding.
        let mut x = x
            .pad_with_same(D::Minus1, 1, 1)?
            .pad_with_same(D::Minus2, 1, 1)?
            .max_pool2d_with_stride(3, 2)?;
        for block in self.stages.iter().flatten() {
            x = block.forward(&x)?;
        }
        Ok(x)
    }

    /// Global average pool and class layer, `1×classes`.
    fn head(&self, features: &Tensor) -> candle_core::Result<Tensor> {
        features.mean(D::Minus1)?.mean(D::Minus1)?.apply(&self.fc)
    }
}

#[derive(Debug)]
struct TapState {
    id: TapId,
    /// Last-stage activations, held as a variable so backward stops there.
    features: Option<Var>,
    logits: Option<Tensor>,
    gradients: Option<Tensor>,
}

/// Bottleneck ResNet with read-only weights. [`ResNet::fork`] gives each worker its own tap state
/// over the same parameters.
#[derive(Debug)]
pub struct ResNet {
    net: Arc<Backbone>,
    config: ResNetConfig,
    device: CandleDevice,
    tap: Option<TapState>,
    next_tap: u64,
}

impl ResNet {
    /// Build from any candle variable source laid out with torchvision names.
    pub fn load(vb: VarBuilder, config: ResNetConfig) -> Result<Self> {
        config.validate()?;
        let device = vb.device().clone();
        let net = Backbone::load(vb, &config).map_err(|e| {
            ForensicError::Config(format!("weights do not fit the ResNet layout: {}", e))
        })?;
        Ok(Self {
            net: Arc::new(net),
            config,
            device,
            tap: None,
            next_tap: 1,
        })
    }

    pub fn from_safetensors(path: &Path, config: ResNetConfig, device: &CandleDevice) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let vb = VarBuilder::from_buffered_safetensors(bytes, DType::F32, device).map_err(|e| {
            ForensicError::Config(format!("weights file {}: {}", path.display(), e))
        })?;
        Self::load(vb, config)
    }

    /// Fetch the default checkpoint into the local hub cache, returning its path.
    pub fn download_weights() -> Result<PathBuf> {
        let hub_error = |e: hf_hub::api::sync::ApiError| {
            ForensicError::Config(format!("model hub {}: {}", DEFAULT_WEIGHTS_REPO, e))
        };
        let api = hf_hub::api::sync::Api::new().map_err(hub_error)?;
        api.model(DEFAULT_WEIGHTS_REPO.to_string())
            .get(WEIGHTS_FILE)
            .map_err(hub_error)
    }

    /// ImageNet ResNet-50 from `weights`, or from the hub when no file is given.
    pub fn pretrained(weights: Option<&Path>, device: Device) -> Result<Self> {
        let device = select_device(device)?;
        let path = match weights {
            Some(path) => path.to_path_buf(),
            None => {
                info!(repo = DEFAULT_WEIGHTS_REPO, "fetching pretrained classifier weights");
                Self::download_weights()?
            }
        };
        let net = Self::from_safetensors(&path, ResNetConfig::resnet50(), &device)?;
        info!(weights = %path.display(), device = ?net.device, "classifier ready");
        Ok(net)
    }

    /// A second instance sharing these weights with fresh tap state.
    pub fn fork(&self) -> Self {
        Self {
            net: Arc::clone(&self.net),
            config: self.config,
            device: self.device.clone(),
            tap: None,
            next_tap: 1,
        }
    }

    pub fn config(&self) -> &ResNetConfig {
        &self.config
    }

    fn tap_mut(&mut self, tap: TapId) -> Result<&mut TapState> {
        match self.tap.as_mut() {
            Some(state) if state.id == tap => Ok(state),
            _ => Err(ForensicError::ModelInferenceError(format!(
                "tap {} is not attached",
                tap.0
            ))),
        }
    }
}

fn select_device(device: Device) -> Result<CandleDevice> {
    match device {
        Device::Cpu => Ok(CandleDevice::Cpu),
        Device::Gpu => {
            let selected = CandleDevice::cuda_if_available(0)
                .map_err(|e| ForensicError::Config(format!("cannot open GPU: {}", e)))?;
            if selected.is_cpu() {
                warn!("no CUDA device available, running the classifier on CPU");
            }
            Ok(selected)
        }
    }
}

fn finite_logits(logits: &Tensor) -> Result<Vec<f32>> {
    let values = to_vec_f32(logits)?;
    if values.iter().any(|v| !v.is_finite()) {
        return Err(ForensicError::ModelInferenceError(
            "logits are not finite".into(),
        ));
    }
    Ok(values)
}

impl Classifier for ResNet {
    fn name(&self) -> &str {
        "resnet"
    }

    fn device(&self) -> CandleDevice {
        self.device.clone()
    }

    fn logits(&self, input: &Tensor) -> Result<Vec<f32>> {
        check_input(input)?;
        let features = self.net.features(input)?;
        finite_logits(&self.net.head(&features)?)
    }

    fn attach_tap(&mut self) -> Result<TapId> {
        if let Some(existing) = &self.tap {
            return Err(ForensicError::ModelInferenceError(format!(
                "last stage is already tapped by tap {}",
                existing.id.0
            )));
        }
        let id = TapId(self.next_tap);
        self.next_tap += 1;
        self.tap = Some(TapState {
            id,
            features: None,
            logits: None,
            gradients: None,
        });
        debug!(tap = id.0, "resnet tap attached");
        Ok(id)
    }

    fn forward_tapped(&mut self, tap: TapId, input: &Tensor) -> Result<Vec<f32>> {
        self.tap_mut(tap)?;
        check_input(input)?;
        // Re-rooting the activations as a variable keeps the backward graph to the head.
        let features = Var::from_tensor(&self.net.features(input)?)?;
        let logits = self.net.head(features.as_tensor())?;
        let values = finite_logits(&logits)?;

        let state = self.tap_mut(tap)?;
        state.features = Some(features);
        state.logits = Some(logits);
        state.gradients = None;
        Ok(values)
    }

    fn backward_tapped(&mut self, tap: TapId, target: usize) -> Result<()> {
        let state = self.tap_mut(tap)?;
        let gradients = {
            let (features, logits) = match (&state.features, &state.logits) {
                (Some(f), Some(l)) => (f, l),
                _ => {
                    return Err(ForensicError::ModelInferenceError(
                        "no activations captured before backward".into(),
                    ))
                }
            };
            let classes = logits.dim(1)?;
            if target >= classes {
                return Err(ForensicError::ModelInferenceError(format!(
                    "class {} out of range for {} classes",
                    target, classes
                )));
            }
            let grads = logits.i((0, target))?.backward()?;
            grads.get(features.as_tensor()).cloned().ok_or_else(|| {
                ForensicError::ModelInferenceError("no gradient reached the tapped stage".into())
            })?
        };
        state.gradients = Some(gradients);
        Ok(())
    }

    fn tapped_maps(&self, tap: TapId) -> Result<(Tensor, Tensor)> {
        match &self.tap {
            Some(TapState {
                id,
                features: Some(a),
                gradients: Some(g),
                ..
            }) if *id == tap => Ok((a.as_tensor().squeeze(0)?, g.squeeze(0)?)),
            Some(state) if state.id == tap => Err(ForensicError::ModelInferenceError(
                "tap has not captured both passes".into(),
            )),
            _ => Err(ForensicError::ModelInferenceError(format!(
                "tap {} is not attached",
                tap.0
            ))),
        }
    }

    fn release_tap(&mut self, tap: TapId) {
        if self.tap.as_ref().map_or(false, |s| s.id == tap) {
            self.tap = None;
            debug!(tap = tap.0, "resnet tap released");
        }
    }

    fn active_taps(&self) -> usize {
        usize::from(self.tap.is_some())
    }
}

/// Small randomly initialized ResNets for exercising the pipeline without a checkpoint.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use candle_nn::VarMap;

    pub fn tiny_config() -> ResNetConfig {
        ResNetConfig {
            layers: [1, 1, 1, 1],
            base_width: 4,
            num_classes: 10,
        }
    }

    pub fn tiny_resnet() -> (VarMap, ResNet) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &CandleDevice::Cpu);
        let net = ResNet::load(vb, tiny_config()).unwrap();
        (varmap, net)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{tiny_config, tiny_resnet};
    use super::*;
    use crate::classifier::{max_softmax, preprocess, INPUT_SIZE};
    use image::{Rgb, RgbImage};

    fn page() -> RgbImage {
        RgbImage::from_fn(120, 160, |x, y| {
            if (x / 10 + y / 14) % 3 == 0 {
                Rgb([20, 20, 30])
            } else {
                Rgb([245, 240, 235])
            }
        })
    }

    fn input() -> Tensor {
        preprocess(&page(), INPUT_SIZE, &CandleDevice::Cpu).unwrap()
    }

    #[test]
    fn logits_are_deterministic_and_shared_by_forks() {
        let (_vars, net) = tiny_resnet();
        let a = net.logits(&input()).unwrap();
        let b = net.fork().logits(&input()).unwrap();
        assert_eq!(a.len(), 10);
        assert_eq!(a, b);
        let p = max_softmax(&a).unwrap();
        assert!(p > 0.0 && p <= 1.0);
    }

    #[test]
    fn rejects_malformed_input() {
        let (_vars, net) = tiny_resnet();
        let gray = Tensor::zeros((1, 1, 8, 8), DType::F32, &CandleDevice::Cpu).unwrap();
        assert_eq!(net.logits(&gray).unwrap_err().kind(), "ModelInferenceError");
    }

    #[test]
    fn last_stage_maps_have_expected_shape() {
        let (_vars, mut net) = tiny_resnet();
        let tap = net.attach_tap().unwrap();
        net.forward_tapped(tap, &input()).unwrap();
        net.backward_tapped(tap, 3).unwrap();
        let (a, g) = net.tapped_maps(tap).unwrap();
        // 224 / 32 = 7, and 4 << 3 channels expanded by 4
        assert_eq!(a.dims(), &[128, 7, 7]);
        assert_eq!(g.dims(), a.dims());
        net.release_tap(tap);
        assert_eq!(net.active_taps(), 0);
    }

    #[test]
    fn gradients_flow_through_pool_and_class_layer() {
        let (_vars, mut net) = tiny_resnet();
        let tap = net.attach_tap().unwrap();
        net.forward_tapped(tap, &input()).unwrap();
        let target = 2;
        net.backward_tapped(tap, target).unwrap();
        let (_, g) = net.tapped_maps(tap).unwrap();

        // d logit_t / d A[k, y, x] = W[t, k] / (h * w) for a pooled linear head.
        let row = to_vec_f32(&net.net.fc.weight().i(target).unwrap()).unwrap();
        let grads = to_vec_f32(&g).unwrap();
        let plane = 49;
        for (k, w) in row.iter().enumerate() {
            for v in &grads[k * plane..(k + 1) * plane] {
                assert!((v - w / plane as f32).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn second_tap_is_refused_until_release() {
        let (_vars, mut net) = tiny_resnet();
        let first = net.attach_tap().unwrap();
        assert!(net.attach_tap().is_err());
        net.release_tap(first);
        let second = net.attach_tap().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn backward_requires_forward_and_valid_class() {
        let (_vars, mut net) = tiny_resnet();
        let tap = net.attach_tap().unwrap();
        assert!(net.backward_tapped(tap, 0).is_err());
        assert!(net.tapped_maps(tap).is_err());
        net.forward_tapped(tap, &input()).unwrap();
        assert!(net.backward_tapped(tap, 10).is_err());
    }

    #[test]
    fn stale_tap_ids_are_rejected() {
        let (_vars, mut net) = tiny_resnet();
        let tap = net.attach_tap().unwrap();
        net.release_tap(tap);
        assert!(net.forward_tapped(tap, &input()).is_err());
    }

    #[test]
    fn safetensors_round_trip() {
        let (vars, net) = tiny_resnet();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.safetensors");
        vars.save(&path).unwrap();
        let loaded = ResNet::from_safetensors(&path, tiny_config(), &CandleDevice::Cpu).unwrap();
        assert_eq!(
            loaded.logits(&input()).unwrap(),
            net.logits(&input()).unwrap()
        );
    }

    #[test]
    fn mismatched_checkpoint_is_config_error() {
        let (vars, _net) = tiny_resnet();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.safetensors");
        vars.save(&path).unwrap();
        let err =
            ResNet::from_safetensors(&path, ResNetConfig::resnet50(), &CandleDevice::Cpu)
                .unwrap_err();
        assert_eq!(err.kind(), "ConfigError");
        let missing = ResNet::from_safetensors(
            &dir.path().join("absent.safetensors"),
            tiny_config(),
            &CandleDevice::Cpu,
        )
        .unwrap_err();
        assert_eq!(missing.kind(), "IoError");
    }

    #[test]
    fn degenerate_config_is_rejected() {
        let config = ResNetConfig {
            layers: [1, 0, 1, 1],
            ..tiny_config()
        };
        assert!(config.validate().is_err());
    }
}
