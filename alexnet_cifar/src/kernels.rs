//! Dense row-major kernels behind the tensor operations. Rows of the output
//! are independent, so every routine splits its output across the rayon pool.

use rayon::prelude::*;

use crate::tensor::Precision;

/// `c (m×n) = a (m×k) · b (k×n)`
pub fn gemm(a: &[Precision], b: &[Precision], m: usize, k: usize, n: usize) -> Vec<Precision> {
    let mut c = vec![0.0; m * n];
    if m == 0 || n == 0 {
        return c;
    }
    c.par_chunks_mut(n).enumerate().for_each(|(i, c_row)| {
        let a_row = &a[i * k..(i + 1) * k];
        for (p, a_ip) in a_row.iter().enumerate() {
            let b_row = &b[p * n..(p + 1) * n];
            for (c_ij, b_pj) in c_row.iter_mut().zip(b_row) {
                *c_ij += *a_ip * *b_pj;
            }
        }
    });
    c
}

/// `c (m×n) = aᵀ · b` with `a` stored as `k×m` and `b` as `k×n`.
pub fn gemm_at_b(a: &[Precision], b: &[Precision], k: usize, m: usize, n: usize) -> Vec<Precision> {
    let mut c = vec![0.0; m * n];
    if m == 0 || n == 0 {
        return c;
    }
    c.par_chunks_mut(n).enumerate().for_each(|(i, c_row)| {
        for p in 0..k {
            let a_pi = a[p * m + i];
            let b_row = &b[p * n..(p + 1) * n];
            for (c_ij, b_pj) in c_row.iter_mut().zip(b_row) {
                *c_ij += a_pi * *b_pj;
            }
        }
    });
    c
}

/// `c (m×n) = a · bᵀ` with `a` stored as `m×k` and `b` as `n×k`.
pub fn gemm_a_bt(a: &[Precision], b: &[Precision], m: usize, k: usize, n: usize) -> Vec<Precision> {
    let mut c = vec![0.0; m * n];
    if m == 0 || n == 0 {
        return c;
    }
    c.par_chunks_mut(n).enumerate().for_each(|(i, c_row)| {
        let a_row = &a[i * k..(i + 1) * k];
        for (j, c_ij) in c_row.iter_mut().enumerate() {
            let b_row = &b[j * k..(j + 1) * k];
            *c_ij = a_row.iter().zip(b_row).map(|(x, y)| *x * *y).sum();
        }
    });
    c
}

/// Static geometry of a 2-d convolution over one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
    pub out_height: usize,
    pub out_width: usize,
}

impl ConvGeometry {
    /// Rows of the unfolded matrix: `channels · k · k`.
    pub fn patch_len(&self) -> usize {
        self.channels * self.kernel_size * self.kernel_size
    }

    /// Columns of the unfolded matrix: one per output position.
    pub fn positions(&self) -> usize {
        self.out_height * self.out_width
    }

    fn source_index(&self, out_pos: usize, ky: usize, kx: usize) -> Option<(usize, usize)> {
        let oy = out_pos / self.out_width;
        let ox = out_pos % self.out_width;
        let iy = (oy * self.stride + ky).checked_sub(self.padding)?;
        let ix = (ox * self.stride + kx).checked_sub(self.padding)?;
        (iy < self.height && ix < self.width).then_some((iy, ix))
    }
}

/// Unfolds one `(C, H, W)` sample into a `(C·k·k) × (OH·OW)` matrix; padded
/// taps read as zero.
pub fn im2col(input: &[Precision], geometry: &ConvGeometry) -> Vec<Precision> {
    let positions = geometry.positions();
    let k = geometry.kernel_size;
    let plane = geometry.height * geometry.width;
    let mut cols = vec![0.0; geometry.patch_len() * positions];

    cols.par_chunks_mut(positions.max(1))
        .enumerate()
        .for_each(|(row, col_row)| {
            let c = row / (k * k);
            let ky = (row / k) % k;
            let kx = row % k;
            let channel = &input[c * plane..(c + 1) * plane];
            for (q, value) in col_row.iter_mut().enumerate() {
                if let Some((iy, ix)) = geometry.source_index(q, ky, kx) {
                    *value = channel[iy * geometry.width + ix];
                }
            }
        });
    cols
}

/// Folds a column matrix back onto a `(C, H, W)` sample, summing overlapping
/// taps. Inverse bookkeeping of [`im2col`].
pub fn col2im(cols: &[Precision], geometry: &ConvGeometry, output: &mut [Precision]) {
    let positions = geometry.positions();
    let k = geometry.kernel_size;
    let plane = geometry.height * geometry.width;

    output
        .par_chunks_mut(plane.max(1))
        .enumerate()
        .for_each(|(c, channel)| {
            for ky in 0..k {
                for kx in 0..k {
                    let row = (c * k + ky) * k + kx;
                    let col_row = &cols[row * positions..(row + 1) * positions];
                    for (q, value) in col_row.iter().enumerate() {
                        if let Some((iy, ix)) = geometry.source_index(q, ky, kx) {
                            channel[iy * geometry.width + ix] += *value;
                        }
                    }
                }
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemm_matches_hand_computed_product() {
        // [1 2 3; 4 5 6] · [7 8; 9 10; 11 12]
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = [7.0, 8.0, 9.0, 10.0, 11.0, 12.0];
        assert_eq!(gemm(&a, &b, 2, 3, 2), vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn transposed_variants_agree_with_plain_gemm() {
        let a = [1.0, -2.0, 0.5, 3.0, 4.0, -1.0];
        let b = [2.0, 1.0, 0.0, -1.0, 3.0, 2.0];
        // a as 3×2 transposed is 2×3; b as 3×2.
        let at = [1.0, 0.5, 4.0, -2.0, 3.0, -1.0];
        assert_eq!(gemm_at_b(&a, &b, 3, 2, 2), gemm(&at, &b, 2, 3, 2));

        // a 2×3 times (b as 2×3)ᵀ
        let bt = [2.0, -1.0, 1.0, 3.0, 0.0, 2.0];
        assert_eq!(gemm_a_bt(&a, &b, 2, 3, 2), gemm(&a, &bt, 2, 3, 2));
    }

    #[test]
    fn im2col_reads_padding_as_zero() {
        let geometry = ConvGeometry {
            channels: 1,
            height: 2,
            width: 2,
            kernel_size: 3,
            stride: 1,
            padding: 1,
            out_height: 2,
            out_width: 2,
        };
        let cols = im2col(&[1.0, 2.0, 3.0, 4.0], &geometry);
        assert_eq!(cols.len(), 9 * 4);
        // centre tap (ky=1, kx=1) sees every pixel once
        assert_eq!(&cols[4 * 4..5 * 4], &[1.0, 2.0, 3.0, 4.0]);
        // top-left tap only lands inside the image for the last output position
        assert_eq!(&cols[0..4], &[0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn col2im_counts_overlapping_taps() {
        let geometry = ConvGeometry {
            channels: 1,
            height: 3,
            width: 3,
            kernel_size: 2,
            stride: 1,
            padding: 0,
            out_height: 2,
            out_width: 2,
        };
        let ones = vec![1.0; geometry.patch_len() * geometry.positions()];
        let mut output = vec![0.0; 9];
        col2im(&ones, &geometry, &mut output);
        assert_eq!(output, vec![1.0, 2.0, 1.0, 2.0, 4.0, 2.0, 1.0, 2.0, 1.0]);
    }
}
