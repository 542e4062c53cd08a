use ndarray::{linalg, prelude::*, RemoveAxis, Zip};
use rayon::prelude::*;

use crate::{QatErr, Result};

/// The stride, zero padding, dilation and grouping of a 2D convolution. Pairs are
/// `(height, width)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub stride: (usize, usize),
    pub padding: (usize, usize),
    pub dilation: (usize, usize),
    pub groups: usize,
}

impl Default for ConvGeometry {
    fn default() -> Self {
        Self {
            stride: (1, 1),
            padding: (0, 0),
            dilation: (1, 1),
            groups: 1,
        }
    }
}

/// Gradients of a convolution with respect to each of its operands.
#[derive(Debug, Clone)]
pub struct ConvGrads {
    pub input: Array4<f32>,
    pub weight: Array4<f32>,
    pub bias: Array1<f32>,
}

/// Dimensions shared by the forward and backward passes, resolved once per call.
#[derive(Debug, Clone, Copy)]
struct Plan {
    n: usize,
    h: usize,
    w: usize,
    cig: usize,
    cog: usize,
    kh: usize,
    kw: usize,
    ho: usize,
    wo: usize,
    geometry: ConvGeometry,
}

impl Plan {
    fn new(
        x: (usize, usize, usize, usize),
        w: (usize, usize, usize, usize),
        geometry: ConvGeometry,
    ) -> Result<Self> {
        let (n, c_in, h, wi) = x;
        let (c_out, cig, kh, kw) = w;
        let ConvGeometry {
            stride: (sh, sw),
            padding: (ph, pw),
            dilation: (dh, dw),
            groups,
        } = geometry;

        if groups == 0 || sh == 0 || sw == 0 || dh == 0 || dw == 0 || kh == 0 || kw == 0 {
            return Err(QatErr::InvalidGeometry(format!(
                "kernel, stride, dilation and groups must be non zero, got {geometry:?} with a {kh}x{kw} kernel"
            )));
        }
        if c_out % groups != 0 {
            return Err(QatErr::InvalidGeometry(format!(
                "{c_out} output channels can't be split in {groups} groups"
            )));
        }
        if c_in != cig * groups {
            return Err(QatErr::ShapeMismatch {
                what: "conv2d input channels",
                got: vec![n, c_in, h, wi],
                expected: vec![n, cig * groups, h, wi],
            });
        }

        let eh = dh * (kh - 1) + 1;
        let ew = dw * (kw - 1) + 1;
        if h + 2 * ph < eh || wi + 2 * pw < ew {
            return Err(QatErr::ShapeMismatch {
                what: "conv2d padded input",
                got: vec![h + 2 * ph, wi + 2 * pw],
                expected: vec![eh, ew],
            });
        }

        Ok(Self {
            n,
            h,
            w: wi,
            cig,
            cog: c_out / groups,
            kh,
            kw,
            ho: (h + 2 * ph - eh) / sh + 1,
            wo: (wi + 2 * pw - ew) / sw + 1,
            geometry,
        })
    }

    fn k(&self) -> usize {
        self.cig * self.kh * self.kw
    }

    fn l(&self) -> usize {
        self.ho * self.wo
    }

    /// Maps an output position and kernel tap to an input position, `None` when it falls on the
    /// zero padding.
    fn tap(&self, (oy, ox): (usize, usize), (i, j): (usize, usize)) -> Option<(usize, usize)> {
        let ConvGeometry {
            stride: (sh, sw),
            padding: (ph, pw),
            dilation: (dh, dw),
            ..
        } = self.geometry;

        let y = (oy * sh + i * dh).checked_sub(ph)?;
        let x = (ox * sw + j * dw).checked_sub(pw)?;
        (y < self.h && x < self.w).then_some((y, x))
    }

    /// Unfolds one group of one sample into a `(cig * kh * kw, ho * wo)` matrix.
    fn im2col(&self, x: ArrayView3<f32>) -> Array2<f32> {
        let mut cols = Array2::zeros((self.k(), self.l()));

        for c in 0..self.cig {
            for i in 0..self.kh {
                for j in 0..self.kw {
                    let row = (c * self.kh + i) * self.kw + j;
                    for oy in 0..self.ho {
                        for ox in 0..self.wo {
                            if let Some((y, x_)) = self.tap((oy, ox), (i, j)) {
                                cols[[row, oy * self.wo + ox]] = x[[c, y, x_]];
                            }
                        }
                    }
                }
            }
        }

        cols
    }

    /// Inverse of `im2col`: accumulates each column entry onto its input position.
    fn col2im(&self, cols: ArrayView2<f32>, mut dx: ArrayViewMut3<f32>) {
        for c in 0..self.cig {
            for i in 0..self.kh {
                for j in 0..self.kw {
                    let row = (c * self.kh + i) * self.kw + j;
                    for oy in 0..self.ho {
                        for ox in 0..self.wo {
                            if let Some((y, x_)) = self.tap((oy, ox), (i, j)) {
                                dx[[c, y, x_]] += cols[[row, oy * self.wo + ox]];
                            }
                        }
                    }
                }
            }
        }
    }

    /// The weights of group `g` as a `(cog, cig * kh * kw)` matrix.
    fn weight_matrix(&self, weight: &ArrayView4<f32>, g: usize) -> Array2<f32> {
        let wg = weight.slice(s![g * self.cog..(g + 1) * self.cog, .., .., ..]);
        Array2::from_shape_fn((self.cog, self.k()), |(o, r)| {
            let (c, rest) = (r / (self.kh * self.kw), r % (self.kh * self.kw));
            wg[[o, c, rest / self.kw, rest % self.kw]]
        })
    }

    /// The output gradient of group `g` as a `(cog, ho * wo)` matrix.
    fn grad_matrix(&self, d: &ArrayView3<f32>, g: usize) -> Array2<f32> {
        let dg = d.slice(s![g * self.cog..(g + 1) * self.cog, .., ..]);
        Array2::from_shape_fn((self.cog, self.l()), |(o, l)| dg[[o, l / self.wo, l % self.wo]])
    }
}

/// Copies a `(rows, cols)` matrix into a view with the same amount of elements per row, in
/// logical order.
fn scatter_rows<D: RemoveAxis>(src: &Array2<f32>, mut dst: ArrayViewMut<f32, D>) {
    for (mut row, src_row) in dst.outer_iter_mut().zip(src.outer_iter()) {
        row.iter_mut().zip(src_row).for_each(|(a, &b)| *a = b);
    }
}

/// 2D convolution over an NCHW input with zero padding.
///
/// # Arguments
/// * `x` - Input of shape `(n, c_in, h, w)`.
/// * `weight` - Kernel of shape `(c_out, c_in / groups, kh, kw)`.
/// * `bias` - Optional bias of length `c_out`.
/// * `geometry` - Stride, padding, dilation and groups.
///
/// # Returns
/// The output of shape `(n, c_out, ho, wo)` with `ho = (h + 2p - d(k - 1) - 1) / s + 1`, or an
/// error if the operands don't fit together.
pub fn conv2d(
    x: ArrayView4<f32>,
    weight: ArrayView4<f32>,
    bias: Option<ArrayView1<f32>>,
    geometry: ConvGeometry,
) -> Result<Array4<f32>> {
    let plan = Plan::new(x.dim(), weight.dim(), geometry)?;
    let c_out = weight.len_of(Axis(0));

    if let Some(b) = &bias {
        if b.len() != c_out {
            return Err(QatErr::ShapeMismatch {
                what: "conv2d bias",
                got: vec![b.len()],
                expected: vec![c_out],
            });
        }
    }

    let weights: Vec<_> = (0..geometry.groups)
        .map(|g| plan.weight_matrix(&weight, g))
        .collect();

    let mut out = Array4::zeros((plan.n, c_out, plan.ho, plan.wo));

    Zip::from(out.outer_iter_mut())
        .and(x.outer_iter())
        .par_for_each(|mut o, xi| {
            let mut res = Array2::zeros((plan.cog, plan.l()));

            for (g, wg) in weights.iter().enumerate() {
                let cols = plan.im2col(xi.slice(s![g * plan.cig..(g + 1) * plan.cig, .., ..]));
                linalg::general_mat_mul(1.0, wg, &cols, 0.0, &mut res);
                scatter_rows(
                    &res,
                    o.slice_mut(s![g * plan.cog..(g + 1) * plan.cog, .., ..]),
                );
            }

            if let Some(b) = &bias {
                for (mut channel, &b) in o.outer_iter_mut().zip(b) {
                    channel += b;
                }
            }
        });

    Ok(out)
}

/// Gradients of [`conv2d`].
///
/// # Arguments
/// * `x` - The input that was fed to `conv2d`.
/// * `weight` - The kernel that was used.
/// * `d` - The gradient with respect to `conv2d`'s output.
/// * `geometry` - The geometry that was used.
///
/// # Returns
/// The gradients with respect to the input, weight and bias.
pub fn conv2d_backward(
    x: ArrayView4<f32>,
    weight: ArrayView4<f32>,
    d: ArrayView4<f32>,
    geometry: ConvGeometry,
) -> Result<ConvGrads> {
    let plan = Plan::new(x.dim(), weight.dim(), geometry)?;
    let c_out = weight.len_of(Axis(0));

    let expected = (plan.n, c_out, plan.ho, plan.wo);
    if d.dim() != expected {
        return Err(QatErr::ShapeMismatch {
            what: "conv2d output gradient",
            got: d.shape().to_vec(),
            expected: vec![expected.0, expected.1, expected.2, expected.3],
        });
    }

    let weights: Vec<_> = (0..geometry.groups)
        .map(|g| plan.weight_matrix(&weight, g))
        .collect();

    let mut input = Array4::zeros(x.raw_dim());
    Zip::from(input.outer_iter_mut())
        .and(d.outer_iter())
        .par_for_each(|mut dxi, di| {
            for (g, wg) in weights.iter().enumerate() {
                let dg = plan.grad_matrix(&di, g);
                let dcols = wg.t().dot(&dg);
                plan.col2im(
                    dcols.view(),
                    dxi.slice_mut(s![g * plan.cig..(g + 1) * plan.cig, .., ..]),
                );
            }
        });

    let wdim = weight.raw_dim();
    let weight_grad = (0..plan.n)
        .into_par_iter()
        .map(|b| {
            let mut dw = Array4::zeros(wdim);
            let (xi, di) = (x.index_axis(Axis(0), b), d.index_axis(Axis(0), b));

            for g in 0..geometry.groups {
                let cols = plan.im2col(xi.slice(s![g * plan.cig..(g + 1) * plan.cig, .., ..]));
                let dwg = plan.grad_matrix(&di, g).dot(&cols.t());
                scatter_rows(
                    &dwg,
                    dw.slice_mut(s![g * plan.cog..(g + 1) * plan.cog, .., .., ..]),
                );
            }

            dw
        })
        .reduce(|| Array4::zeros(wdim), |a, b| a + b);

    let bias = d
        .sum_axis(Axis(0))
        .sum_axis(Axis(1))
        .sum_axis(Axis(1));

    Ok(ConvGrads {
        input,
        weight: weight_grad,
        bias,
    })
}
