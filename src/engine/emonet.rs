//! EmoNet network
//!
//! A face-alignment backbone (stacked hourglasses producing 68 landmark
//! heatmaps) followed by an emotion head. The summed heatmaps gate the
//! hourglass features, and the head regresses `class_count` expression
//! logits plus valence and arousal.
//!
//! Parameter names follow the published checkpoints so the weights bind by
//! name.

use candle_core::{Module, ModuleT, Result, Tensor, D};
use candle_nn::{
    batch_norm, conv2d, conv2d_no_bias, linear, BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig,
    Linear, VarBuilder,
};

use super::model::{EmotionNetwork, NetworkBuilder, NetworkOutput};

const FEATURES: usize = 256;
const LANDMARKS: usize = 68;
const HOURGLASS_DEPTH: usize = 4;
const EMO_BLOCKS: usize = 4;
/// Stem stride and pooling reduce the input by this factor before the hourglasses
const STEM_REDUCTION: u32 = 4;
/// Final average pool window of the emotion head
const HEAD_POOL: u32 = 4;
/// Valence and arousal
const REGRESSION_OUTPUTS: usize = 2;

fn conv3x3(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        ..Default::default()
    };
    conv2d_no_bias(in_c, out_c, 3, cfg, vb)
}

fn conv1x1(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Conv2d> {
    conv2d(in_c, out_c, 1, Conv2dConfig::default(), vb)
}

fn bn(channels: usize, vb: VarBuilder) -> Result<BatchNorm> {
    batch_norm(channels, BatchNormConfig::default(), vb)
}

/// Running statistics only
fn bn_eval(layer: &BatchNorm, x: &Tensor) -> Result<Tensor> {
    layer.forward_t(x, false)
}

/// Pre-activation residual block whose output concatenates three branches
struct ConvBlock {
    bn1: BatchNorm,
    conv1: Conv2d,
    bn2: BatchNorm,
    conv2: Conv2d,
    bn3: BatchNorm,
    conv3: Conv2d,
    downsample: Option<(BatchNorm, Conv2d)>,
}

impl ConvBlock {
    fn new(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Self> {
        let half = out_c / 2;
        let quarter = out_c / 4;

        let downsample = if in_c != out_c {
            let ds = vb.pp("downsample");
            Some((
                bn(in_c, ds.pp("0"))?,
                conv2d_no_bias(in_c, out_c, 1, Conv2dConfig::default(), ds.pp("2"))?,
            ))
        } else {
            None
        };

        Ok(Self {
            bn1: bn(in_c, vb.pp("bn1"))?,
            conv1: conv3x3(in_c, half, vb.pp("conv1"))?,
            bn2: bn(half, vb.pp("bn2"))?,
            conv2: conv3x3(half, quarter, vb.pp("conv2"))?,
            bn3: bn(quarter, vb.pp("bn3"))?,
            conv3: conv3x3(quarter, quarter, vb.pp("conv3"))?,
            downsample,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let out1 = self.conv1.forward(&bn_eval(&self.bn1, x)?.relu()?)?;
        let out2 = self.conv2.forward(&bn_eval(&self.bn2, &out1)?.relu()?)?;
        let out3 = self.conv3.forward(&bn_eval(&self.bn3, &out2)?.relu()?)?;
        let out = Tensor::cat(&[&out1, &out2, &out3], 1)?;

        let residual = match &self.downsample {
            Some((norm, conv)) => conv.forward(&bn_eval(norm, x)?.relu()?)?,
            None => x.clone(),
        };
        out + residual
    }
}

/// Recursive hourglass; level `n` holds blocks `b1_n`, `b2_n`, `b3_n` and the
/// innermost level an extra `b2_plus_1`.
struct HourGlass {
    levels: Vec<HourGlassLevel>,
    innermost: ConvBlock,
}

struct HourGlassLevel {
    b1: ConvBlock,
    b2: ConvBlock,
    b3: ConvBlock,
}

impl HourGlass {
    fn new(depth: usize, features: usize, vb: VarBuilder) -> Result<Self> {
        // outermost first
        let levels = (1..=depth)
            .rev()
            .map(|level| {
                Ok(HourGlassLevel {
                    b1: ConvBlock::new(features, features, vb.pp(format!("b1_{}", level)))?,
                    b2: ConvBlock::new(features, features, vb.pp(format!("b2_{}", level)))?,
                    b3: ConvBlock::new(features, features, vb.pp(format!("b3_{}", level)))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            levels,
            innermost: ConvBlock::new(features, features, vb.pp("b2_plus_1"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_level(0, x)
    }

    fn forward_level(&self, i: usize, x: &Tensor) -> Result<Tensor> {
        let level = &self.levels[i];
        let up1 = level.b1.forward(x)?;
        let low1 = level.b2.forward(&x.avg_pool2d(2)?)?;
        let low2 = if i + 1 < self.levels.len() {
            self.forward_level(i + 1, &low1)?
        } else {
            self.innermost.forward(&low1)?
        };
        let low3 = level.b3.forward(&low2)?;
        let (_, _, h, w) = low3.dims4()?;
        let up2 = low3.upsample_nearest2d(h * 2, w * 2)?;
        up1 + up2
    }
}

struct Stack {
    hourglass: HourGlass,
    top: ConvBlock,
    conv_last: Conv2d,
    bn_end: BatchNorm,
    heatmap: Conv2d,
    /// Feature and heatmap remaps feeding the next stack; absent on the last
    remap: Option<(Conv2d, Conv2d)>,
}

/// EmoNet with `num_stacks` hourglasses and attention over landmark heatmaps
pub struct EmoNet {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: ConvBlock,
    conv3: ConvBlock,
    conv4: ConvBlock,
    stacks: Vec<Stack>,
    emo_input: Conv2d,
    emo_blocks: Vec<ConvBlock>,
    fc1: Linear,
    fc_bn: BatchNorm,
    fc2: Linear,
    class_count: usize,
}

impl EmoNet {
    pub fn new(num_stacks: usize, class_count: usize, vb: VarBuilder) -> Result<Self> {
        let stem_cfg = Conv2dConfig {
            padding: 3,
            stride: 2,
            ..Default::default()
        };

        let stacks = (0..num_stacks)
            .map(|i| {
                let remap = if i + 1 < num_stacks {
                    Some((
                        conv1x1(FEATURES, FEATURES, vb.pp(format!("bl{}", i)))?,
                        conv1x1(LANDMARKS, FEATURES, vb.pp(format!("al{}", i)))?,
                    ))
                } else {
                    None
                };
                Ok(Stack {
                    hourglass: HourGlass::new(HOURGLASS_DEPTH, FEATURES, vb.pp(format!("m{}", i)))?,
                    top: ConvBlock::new(FEATURES, FEATURES, vb.pp(format!("top_m_{}", i)))?,
                    conv_last: conv1x1(FEATURES, FEATURES, vb.pp(format!("conv_last{}", i)))?,
                    bn_end: bn(FEATURES, vb.pp(format!("bn_end{}", i)))?,
                    heatmap: conv1x1(FEATURES, LANDMARKS, vb.pp(format!("l{}", i)))?,
                    remap,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        // stem features plus one feature map per stack
        let emo_in = FEATURES * (num_stacks + 1);
        let emo_net = vb.pp("emo_net_2");
        let emo_blocks = (0..EMO_BLOCKS)
            .map(|i| ConvBlock::new(FEATURES, FEATURES, emo_net.pp((2 * i).to_string())))
            .collect::<Result<Vec<_>>>()?;

        let fc = vb.pp("emo_fc_2");

        Ok(Self {
            conv1: conv2d(3, 64, 7, stem_cfg, vb.pp("conv1"))?,
            bn1: bn(64, vb.pp("bn1"))?,
            conv2: ConvBlock::new(64, 128, vb.pp("conv2"))?,
            conv3: ConvBlock::new(128, 128, vb.pp("conv3"))?,
            conv4: ConvBlock::new(128, FEATURES, vb.pp("conv4"))?,
            stacks,
            emo_input: conv1x1(emo_in, FEATURES, vb.pp("conv1x1_input_emo_2"))?,
            emo_blocks,
            fc1: linear(FEATURES, 128, fc.pp("0"))?,
            fc_bn: bn(128, fc.pp("1"))?,
            fc2: linear(128, class_count + REGRESSION_OUTPUTS, fc.pp("3"))?,
            class_count,
        })
    }
}

impl EmotionNetwork for EmoNet {
    fn forward(&self, input: &Tensor) -> Result<NetworkOutput> {
        let x = bn_eval(&self.bn1, &self.conv1.forward(input)?)?.relu()?;
        let x = self.conv2.forward(&x)?.avg_pool2d(2)?;
        let x = self.conv3.forward(&x)?;
        let x = self.conv4.forward(&x)?;

        let mut previous = x.clone();
        let mut features = Vec::with_capacity(self.stacks.len());
        let mut heatmaps = None;

        for stack in &self.stacks {
            let hg = stack.hourglass.forward(&previous)?;
            let ll = stack.top.forward(&hg)?;
            let ll = bn_eval(&stack.bn_end, &stack.conv_last.forward(&ll)?)?.relu()?;
            let tmp_out = stack.heatmap.forward(&ll)?;

            let ll = match &stack.remap {
                Some((bl, al)) => {
                    let ll = bl.forward(&ll)?;
                    previous = ((previous + &ll)? + al.forward(&tmp_out)?)?;
                    ll
                }
                None => ll,
            };
            features.push(ll);
            heatmaps = Some(tmp_out);
        }

        let features = Tensor::cat(&features, 1)?;
        let features = match heatmaps {
            Some(tmp_out) => features.broadcast_mul(&tmp_out.sum_keepdim(1)?)?,
            None => features,
        };
        let emo_feat = Tensor::cat(&[&x, &features], 1)?;

        let mut y = self.emo_input.forward(&emo_feat)?;
        for block in &self.emo_blocks {
            y = block.forward(&y)?.max_pool2d(2)?;
        }
        let y = y.avg_pool2d(4)?.flatten_from(1)?;

        let y = self.fc1.forward(&y)?;
        let y = bn_eval(&self.fc_bn, &y)?.relu()?;
        let y = self.fc2.forward(&y)?;

        let n = self.class_count;
        Ok(NetworkOutput {
            expression: y.narrow(D::Minus1, 0, n)?,
            valence: y.narrow(D::Minus1, n, 1)?.flatten_all()?,
            arousal: y.narrow(D::Minus1, n + 1, 1)?.flatten_all()?,
        })
    }
}

/// Builds [`EmoNet`] with the two-stack layout of the published weights
pub struct EmoNetBuilder {
    pub num_stacks: usize,
}

impl Default for EmoNetBuilder {
    fn default() -> Self {
        Self { num_stacks: 2 }
    }
}

impl NetworkBuilder for EmoNetBuilder {
    fn build(&self, vb: VarBuilder, class_count: usize) -> Result<Box<dyn EmotionNetwork>> {
        Ok(Box::new(EmoNet::new(self.num_stacks, class_count, vb)?))
    }

    /// The hourglasses halve the feature map `HOURGLASS_DEPTH` times and
    /// upsample back, so it must divide evenly; the head then pools
    /// `EMO_BLOCKS` times and its last window must cover exactly one cell.
    fn check_input_size(&self, size: u32) -> std::result::Result<(), String> {
        let unit = STEM_REDUCTION << HOURGLASS_DEPTH;
        if size % unit != 0 {
            return Err(format!("must be a multiple of {}", unit));
        }

        let head = (size / STEM_REDUCTION) >> EMO_BLOCKS;
        if !(HEAD_POOL..2 * HEAD_POOL).contains(&head) {
            let min = HEAD_POOL * (STEM_REDUCTION << EMO_BLOCKS);
            return Err(format!("must be at least {} and below {}", min, 2 * min));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_conv_block_widths() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let block = ConvBlock::new(64, 128, vb).unwrap();
        let x = Tensor::zeros((1, 64, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let y = block.forward(&x).unwrap();
        assert_eq!(y.dims(), &[1, 128, 8, 8]);
    }

    #[test]
    fn test_input_size_check() {
        let builder = EmoNetBuilder::default();
        for size in [256, 320, 448] {
            assert!(builder.check_input_size(size).is_ok(), "{} should be accepted", size);
        }
        for size in [0, 64, 128, 200, 260, 512, 1024] {
            assert!(builder.check_input_size(size).is_err(), "{} should be rejected", size);
        }
    }

    #[test]
    fn test_hourglass_keeps_resolution() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let hg = HourGlass::new(2, 16, vb).unwrap();
        let x = Tensor::zeros((1, 16, 8, 8), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(hg.forward(&x).unwrap().dims(), &[1, 16, 8, 8]);
    }
}
