//! Fourier interpolation by zero padding.
//!
//! A real-space tensor is padded with zeros between the low and the high block of every axis
//! (see [`padded_slots`]) and transformed back to k-space on the denser mesh. The interpolated
//! tensor agrees with the input at the original k-points, is exact for band-limited input and
//! stays Hermitian when the input is.
use anyhow::ensure;
use log::debug;
use ndarray as na;

use crate::{
    comm::Comm,
    fourier::{
        GridFft,
        check_orbital_block,
        map_slices1,
        map_slices3,
    },
    grid::{
        Grid,
        padded_slots,
    },
    types::{
        Result,
        c64,
    },
};


/// Insert `pad[d]` zeros along axis `d` between the low and high block of `aux`.
pub fn zero_pad_3d(aux: na::ArrayView3<c64>, pad: [usize; 3]) -> na::Array3<c64> {
    let (n1, n2, n3) = aux.dim();
    let dims = [n1, n2, n3];
    let slots = [0, 1, 2].map(|d| {
        (0 .. dims[d]).map(|i| padded_slots(i, dims[d], pad[d])).collect::<Vec<_>>()
    });

    let mut out = na::Array3::<c64>::zeros((n1 + pad[0], n2 + pad[1], n3 + pad[2]));
    for ((i, j, k), v) in aux.indexed_iter() {
        for &(a, wa) in slots[0][i].iter() {
            for &(b, wb) in slots[1][j].iter() {
                for &(c, wc) in slots[2][k].iter() {
                    out[[a, b, c]] += *v * (wa * wb * wc);
                }
            }
        }
    }
    out
}


/// Insert `pad` zeros between the low and high block of `aux`.
pub fn zero_pad_1d(aux: na::ArrayView1<c64>, pad: usize) -> na::Array1<c64> {
    let n = aux.len();
    let mut out = na::Array1::<c64>::zeros(n + pad);
    for (i, v) in aux.iter().enumerate() {
        for (dest, w) in padded_slots(i, n, pad) {
            out[dest] += *v * w;
        }
    }
    out
}


/// Volume mode: real-space `hr` of shape `(nawf, nawf, n1, n2, n3, nspin)` to k-space on the
/// grid `(n1+p1, n2+p2, n3+p3)`.
///
/// With `pad == [0, 0, 0]` this is the plain R -> k transform.
pub fn interpolate_volume<C: Comm>(comm: &C, hr: na::ArrayView6<c64>, pad: [usize; 3]) -> Result<na::Array6<c64>> {
    check_orbital_block(hr.shape())?;
    let (_, _, n1, n2, n3, _) = hr.dim();
    let grid = Grid::new(n1, n2, n3)?;
    let dense = grid.padded(pad);
    if comm.is_root() {
        debug!("Zero padding {} -> {}", grid, dense);
    }

    let dims = dense.dims();
    map_slices3(comm, hr, dims, || GridFft::forward(&dims), |fft, aux| {
        let mut padded = zero_pad_3d(aux, pad);
        fft.process(&mut padded)?;
        Ok(padded)
    })
}


/// Path mode: resample `hk_path`, shape `(nawf, nawf, nL, nspin)` sampled along a path in visiting
/// order, on `nL + npad` points.
///
/// Sample `i` of the input lands on sample `i * (nL + npad) / nL` of the output whenever that
/// ratio is integral.
pub fn interpolate_path<C: Comm>(comm: &C, hk_path: na::ArrayView4<c64>, npad: usize) -> Result<na::Array4<c64>> {
    check_orbital_block(hk_path.shape())?;
    let nl = hk_path.dim().2;
    ensure!(nl > 0, "Cannot interpolate an empty path.");
    if comm.is_root() {
        debug!("Path interpolation {} -> {} points", nl, nl + npad);
    }

    let init = || (GridFft::inverse(&[nl]), GridFft::forward(&[nl + npad]));
    map_slices1(comm, hk_path, nl + npad, init, |(inverse, forward), aux| {
        let mut aux = aux.to_owned();
        inverse.process(&mut aux)?;
        let mut padded = zero_pad_1d(aux.view(), npad);
        forward.process(&mut padded)?;
        Ok(padded)
    })
}


/// Flatten the grid axes of `(nawf, nawf, n1, n2, n3, nspin)` into one path axis visited with the
/// last grid index running fastest.
pub fn flatten_grid(hk: na::ArrayView6<c64>) -> Result<na::Array4<c64>> {
    check_orbital_block(hk.shape())?;
    let (nawf, _, n1, n2, n3, nspin) = hk.dim();
    let grid = Grid::new(n1, n2, n3)?;

    let mut out = na::Array4::<c64>::zeros((nawf, nawf, grid.nktot(), nspin));
    for i in 0 .. n1 {
        for j in 0 .. n2 {
            for k in 0 .. n3 {
                out.slice_mut(na::s![.., .., grid.linear_index(i, j, k), ..])
                    .assign(&hk.slice(na::s![.., .., i, j, k, ..]));
            }
        }
    }
    Ok(out)
}
