use serde::{Deserialize, Serialize};

use crate::{arch::functional::ConvGeometry, QatErr, Result};

/// How a convolution fills the border around its input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddingMode {
    #[default]
    Zeros,
    Circular,
}

/// The geometry of a 2D convolution layer. Pairs are `(height, width)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conv2dOptions {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: (usize, usize),
    #[serde(default = "one_pair")]
    pub stride: (usize, usize),
    #[serde(default)]
    pub padding: (usize, usize),
    #[serde(default = "one_pair")]
    pub dilation: (usize, usize),
    #[serde(default = "one")]
    pub groups: usize,
    #[serde(default = "yes")]
    pub bias: bool,
    #[serde(default)]
    pub padding_mode: PaddingMode,
}

fn one_pair() -> (usize, usize) {
    (1, 1)
}

fn one() -> usize {
    1
}

fn yes() -> bool {
    true
}

impl Conv2dOptions {
    /// Creates the options of a convolution with unit stride and dilation, no padding, a single
    /// group and a bias.
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: (usize, usize)) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel_size,
            stride: one_pair(),
            padding: (0, 0),
            dilation: one_pair(),
            groups: 1,
            bias: true,
            padding_mode: PaddingMode::Zeros,
        }
    }

    pub fn stride(mut self, stride: (usize, usize)) -> Self {
        self.stride = stride;
        self
    }

    pub fn padding(mut self, padding: (usize, usize)) -> Self {
        self.padding = padding;
        self
    }

    pub fn dilation(mut self, dilation: (usize, usize)) -> Self {
        self.dilation = dilation;
        self
    }

    pub fn groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    pub fn bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    pub fn padding_mode(mut self, padding_mode: PaddingMode) -> Self {
        self.padding_mode = padding_mode;
        self
    }

    /// Checks that the options describe a buildable layer.
    pub fn validate(&self) -> Result<()> {
        let &Self {
            in_channels,
            out_channels,
            kernel_size: (kh, kw),
            stride: (sh, sw),
            dilation: (dh, dw),
            groups,
            ..
        } = self;

        if in_channels == 0 || out_channels == 0 {
            return Err(QatErr::InvalidGeometry(format!(
                "channels must be non zero, got {in_channels} in and {out_channels} out"
            )));
        }
        if kh == 0 || kw == 0 || sh == 0 || sw == 0 || dh == 0 || dw == 0 {
            return Err(QatErr::InvalidGeometry(format!(
                "kernel size, stride and dilation must be non zero, got {:?}, {:?} and {:?}",
                self.kernel_size, self.stride, self.dilation
            )));
        }
        if groups == 0 || in_channels % groups != 0 || out_channels % groups != 0 {
            return Err(QatErr::InvalidGeometry(format!(
                "{in_channels} in and {out_channels} out channels can't be split in {groups} groups"
            )));
        }

        Ok(())
    }

    /// The shape of the weight, `(out_channels, in_channels / groups, kh, kw)`.
    pub fn weight_shape(&self) -> (usize, usize, usize, usize) {
        let (kh, kw) = self.kernel_size;
        (self.out_channels, self.in_channels / self.groups, kh, kw)
    }

    /// Amount of inputs each output element is computed from.
    pub fn fan_in(&self) -> usize {
        let (_, cig, kh, kw) = self.weight_shape();
        cig * kh * kw
    }

    /// The geometry handed to the convolution primitive. Circular padding is applied beforehand,
    /// so in that mode the primitive runs without padding.
    pub fn geometry(&self) -> ConvGeometry {
        let padding = match self.padding_mode {
            PaddingMode::Zeros => self.padding,
            PaddingMode::Circular => (0, 0),
        };

        ConvGeometry {
            stride: self.stride,
            padding,
            dilation: self.dilation,
            groups: self.groups,
        }
    }
}
