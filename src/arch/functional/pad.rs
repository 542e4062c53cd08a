use ndarray::{s, Array4, ArrayView4};

use crate::{QatErr, Result};

/// Amount of circular padding on each side of the two spatial axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CircularPad {
    pub left: usize,
    pub right: usize,
    pub top: usize,
    pub bottom: usize,
}

impl CircularPad {
    /// Splits a layer's `(height, width)` padding into the per side amounts used when padding
    /// circularly. The leading side gets `ceil(p / 2)` and the trailing side `floor(p / 2)`.
    pub fn from_padding((ph, pw): (usize, usize)) -> Self {
        Self {
            left: pw.div_ceil(2),
            right: pw / 2,
            top: ph.div_ceil(2),
            bottom: ph / 2,
        }
    }

    fn check(&self, h: usize, w: usize) -> Result<()> {
        for (pad, size) in [(self.top, h), (self.bottom, h), (self.left, w), (self.right, w)] {
            if pad > size {
                return Err(QatErr::InvalidPadding { pad, size });
            }
        }

        Ok(())
    }

    /// Maps a padded coordinate back to its source in an unpadded input of size `(h, w)`.
    fn source(&self, (y, x): (usize, usize), (h, w): (usize, usize)) -> (usize, usize) {
        ((y + h - self.top) % h, (x + w - self.left) % w)
    }
}

/// Pads an NCHW tensor by wrapping values around from the opposite edge.
///
/// # Arguments
/// * `x` - The input tensor.
/// * `pad` - The amount of padding on each side.
///
/// # Returns
/// The padded tensor or an error if any side's pad is larger than the input along that axis.
pub fn pad_circular(x: ArrayView4<f32>, pad: CircularPad) -> Result<Array4<f32>> {
    let (n, c, h, w) = x.dim();
    pad.check(h, w)?;

    let ho = h + pad.top + pad.bottom;
    let wo = w + pad.left + pad.right;
    let mut out = Array4::zeros((n, c, ho, wo));

    for y in 0..ho {
        for x_ in 0..wo {
            let (sy, sx) = pad.source((y, x_), (h, w));
            out.slice_mut(s![.., .., y, x_])
                .assign(&x.slice(s![.., .., sy, sx]));
        }
    }

    Ok(out)
}

/// Gradient of [`pad_circular`]: folds every padded position back onto its source.
///
/// # Arguments
/// * `d` - The gradient with respect to the padded tensor.
/// * `pad` - The padding used in the forward pass.
/// * `size` - The `(height, width)` of the unpadded input.
pub fn pad_circular_backward(
    d: ArrayView4<f32>,
    pad: CircularPad,
    (h, w): (usize, usize),
) -> Result<Array4<f32>> {
    let (n, c, ho, wo) = d.dim();
    pad.check(h, w)?;

    let expected = (ho, wo);
    let got = (h + pad.top + pad.bottom, w + pad.left + pad.right);
    if expected != got {
        return Err(QatErr::ShapeMismatch {
            what: "circular padding gradient",
            got: vec![n, c, ho, wo],
            expected: vec![n, c, got.0, got.1],
        });
    }

    let mut out = Array4::zeros((n, c, h, w));

    for y in 0..ho {
        for x_ in 0..wo {
            let (sy, sx) = pad.source((y, x_), (h, w));
            let mut dst = out.slice_mut(s![.., .., sy, sx]);
            dst += &d.slice(s![.., .., y, x_]);
        }
    }

    Ok(out)
}
