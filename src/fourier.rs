//! Discrete Fourier transforms between the k-point mesh and the real-space lattice-vector mesh.
//!
//! Tensors on the grid are laid out as `(nawf, nawf, n1, n2, n3, nspin)`. The inverse
//! transform (k -> R) carries the `1/N` factor and the forward transform (R -> k) none, so that
//! `r_to_k(k_to_r(Hk)) == Hk`:
//!
//! ```text
//! HR[R] = 1/N Σ_k Hk[k] exp(+2πi k·R)
//! Hk[k] =     Σ_R HR[R] exp(-2πi k·R)
//! ```
use std::f64::consts::PI;

use anyhow::ensure;
use itertools::iproduct;
use log::debug;
use ndarray as na;
use ndrustfft::{
    FftHandler,
    ndfft,
    ndifft,
};
use rayon::prelude::*;
use rustfft::FftDirection;

use crate::{
    comm::Comm,
    grid::{
        Grid,
        KIndex,
        RGrid,
        is_nyquist,
    },
    types::{
        Result,
        c64,
        Mat33,
    },
};


/// FFT handlers for every axis of a dense complex array.
///
/// The inverse transform is normalized by `1/n` along each axis, the forward one is not.
pub struct GridFft {
    dims:      Vec<usize>,
    handlers:  Vec<FftHandler<f64>>,
    direction: FftDirection,
}


impl GridFft {
    pub fn new(dims: &[usize], direction: FftDirection) -> Self {
        let handlers = dims.iter()
            .map(|&n| FftHandler::<f64>::new(n))
            .collect::<Vec<_>>();
        Self { dims: dims.to_vec(), handlers, direction }
    }

    pub fn forward(dims: &[usize]) -> Self {
        Self::new(dims, FftDirection::Forward)
    }

    pub fn inverse(dims: &[usize]) -> Self {
        Self::new(dims, FftDirection::Inverse)
    }

    pub fn direction(&self) -> FftDirection {
        self.direction
    }

    /// Transform `data` in place along all of its axes.
    pub fn process<D: na::Dimension>(&mut self, data: &mut na::Array<c64, D>) -> Result<()> {
        ensure!(data.shape() == self.dims.as_slice(),
            "FFT planned for shape {:?}, got {:?}.", self.dims, data.shape());

        let direction = self.direction;
        let mut buffer = na::Array::<c64, D>::zeros(data.raw_dim());
        for (axis, handler) in self.handlers.iter_mut().enumerate() {
            match direction {
                FftDirection::Forward => ndfft(&*data, &mut buffer, handler, axis),
                FftDirection::Inverse => ndifft(&*data, &mut buffer, handler, axis),
            }
            std::mem::swap(data, &mut buffer);
        }
        Ok(())
    }
}


/// Reject tensors whose orbital block is not square.
pub fn check_orbital_block(shape: &[usize]) -> Result<()> {
    ensure!(shape.len() >= 2, "Tensor of rank {} has no orbital block.", shape.len());
    ensure!(shape[0] == shape[1],
        "Orbital dimensions of the tensor must be equal, got {}x{}.", shape[0], shape[1]);
    Ok(())
}


/// Apply `f` to every `(i, j, spin)` slice of a `(nawf, nawf, n1, n2, n3, nspin)` tensor.
///
/// The slices are partitioned over the workers of `comm`, each worker runs its share on the rayon
/// pool with one `init()` state per rayon job, and the per-worker results are summed into the
/// returned tensor of spatial shape `out_dims`. A failure on any worker fails all of them.
pub(crate) fn map_slices3<C, S, I, F>(comm: &C, input: na::ArrayView6<c64>, out_dims: [usize; 3], init: I, f: F) -> Result<na::Array6<c64>>
where C: Comm,
      I: Fn() -> S + Sync + Send,
      F: Fn(&mut S, na::ArrayView3<c64>) -> Result<na::Array3<c64>> + Sync + Send {
    check_orbital_block(input.shape())?;
    let (nawf, _, _, _, _, nspin) = input.dim();

    let slices = iproduct!(0 .. nspin, 0 .. nawf, 0 .. nawf).collect::<Vec<_>>();
    let (start, end) = comm.partition(slices.len())?;

    let done = slices[start .. end].par_iter()
        .map_init(&init, |state, &(ispin, i, j)| {
            f(state, input.slice(na::s![i, j, .., .., .., ispin])).map(|aux| ((ispin, i, j), aux))
        })
        .collect::<Result<Vec<_>>>();
    let done = comm.agree(done)?;

    let mut out = na::Array6::<c64>::zeros((nawf, nawf, out_dims[0], out_dims[1], out_dims[2], nspin));
    for ((ispin, i, j), aux) in done {
        out.slice_mut(na::s![i, j, .., .., .., ispin]).assign(&aux);
    }

    comm.all_reduce_sum(out)
}


/// Apply `f` to every `(i, j, spin)` slice of a `(nawf, nawf, nL, nspin)` tensor, see [`map_slices3`].
pub(crate) fn map_slices1<C, S, I, F>(comm: &C, input: na::ArrayView4<c64>, out_len: usize, init: I, f: F) -> Result<na::Array4<c64>>
where C: Comm,
      I: Fn() -> S + Sync + Send,
      F: Fn(&mut S, na::ArrayView1<c64>) -> Result<na::Array1<c64>> + Sync + Send {
    check_orbital_block(input.shape())?;
    let (nawf, _, _, nspin) = input.dim();

    let slices = iproduct!(0 .. nspin, 0 .. nawf, 0 .. nawf).collect::<Vec<_>>();
    let (start, end) = comm.partition(slices.len())?;

    let done = slices[start .. end].par_iter()
        .map_init(&init, |state, &(ispin, i, j)| {
            f(state, input.slice(na::s![i, j, .., ispin])).map(|aux| ((ispin, i, j), aux))
        })
        .collect::<Result<Vec<_>>>();
    let done = comm.agree(done)?;

    let mut out = na::Array4::<c64>::zeros((nawf, nawf, out_len, nspin));
    for ((ispin, i, j), aux) in done {
        out.slice_mut(na::s![i, j, .., ispin]).assign(&aux);
    }

    comm.all_reduce_sum(out)
}


/// k <-> R transform engine bound to one k-grid.
#[derive(Debug, Clone)]
pub struct FourierEngine {
    kindex: KIndex,
    rgrid:  RGrid,
}


impl FourierEngine {
    pub fn new(kindex: KIndex, a_vectors: &Mat33<f64>) -> Result<Self> {
        let rgrid = RGrid::new(kindex.grid(), a_vectors)?;
        Self::with_rgrid(kindex, rgrid)
    }

    pub fn with_rgrid(kindex: KIndex, rgrid: RGrid) -> Result<Self> {
        let grid = kindex.grid();
        ensure!(rgrid.grid() == grid,
            "Lattice vectors were generated for grid {}, but the k-points form grid {}.", rgrid.grid(), grid);
        ensure!(rgrid.nrtot() == grid.nktot(),
            "Grid {} needs {} lattice vectors, got {}.", grid, grid.nktot(), rgrid.nrtot());
        debug!("Fourier engine ready: grid {}, {} lattice vectors.", grid, rgrid.nrtot());
        Ok(Self { kindex, rgrid })
    }

    pub fn grid(&self) -> Grid {
        self.kindex.grid()
    }

    pub fn kindex(&self) -> &KIndex {
        &self.kindex
    }

    pub fn rgrid(&self) -> &RGrid {
        &self.rgrid
    }

    fn check_grid_tensor(&self, t: &na::ArrayView6<c64>) -> Result<()> {
        check_orbital_block(t.shape())?;
        let grid = self.grid();
        ensure!(t.shape()[2 .. 5] == grid.dims(),
            "Tensor has grid dimensions {:?}, expected {:?}.", &t.shape()[2 .. 5], grid.dims());
        Ok(())
    }

    /// Reorder `(nawf, nawf, nkpnts, nspin)` from emission order onto the 3D grid.
    pub fn to_grid(&self, hks: na::ArrayView4<c64>) -> Result<na::Array6<c64>> {
        check_orbital_block(hks.shape())?;
        let grid = self.grid();
        let (nawf, _, nkpnts, nspin) = hks.dim();
        ensure!(nkpnts == grid.nktot(),
            "Grid {} needs {} k-points, the tensor has {}.", grid, grid.nktot(), nkpnts);

        let mut out = na::Array6::<c64>::zeros((nawf, nawf, grid.n1, grid.n2, grid.n3, nspin));
        for ((i, j, k), &ik) in self.kindex.table().indexed_iter() {
            out.slice_mut(na::s![.., .., i, j, k, ..])
                .assign(&hks.slice(na::s![.., .., ik, ..]));
        }
        Ok(out)
    }

    /// Reorder a grid tensor back into emission order, `(nawf, nawf, nkpnts, nspin)`.
    pub fn from_grid(&self, hk: na::ArrayView6<c64>) -> Result<na::Array4<c64>> {
        self.check_grid_tensor(&hk)?;
        let (nawf, _, _, _, _, nspin) = hk.dim();

        let mut out = na::Array4::<c64>::zeros((nawf, nawf, self.grid().nktot(), nspin));
        for ((i, j, k), &ik) in self.kindex.table().indexed_iter() {
            out.slice_mut(na::s![.., .., ik, ..])
                .assign(&hk.slice(na::s![.., .., i, j, k, ..]));
        }
        Ok(out)
    }

    /// k -> R, inverse 3D transform of every orbital pair and spin.
    pub fn k_to_r<C: Comm>(&self, comm: &C, hk: na::ArrayView6<c64>) -> Result<na::Array6<c64>> {
        self.check_grid_tensor(&hk)?;
        let dims = self.grid().dims();
        map_slices3(comm, hk, dims, || GridFft::inverse(&dims), |fft, aux| {
            let mut aux = aux.to_owned();
            fft.process(&mut aux)?;
            Ok(aux)
        })
    }

    /// R -> k, forward 3D transform of every orbital pair and spin.
    pub fn r_to_k<C: Comm>(&self, comm: &C, hr: na::ArrayView6<c64>) -> Result<na::Array6<c64>> {
        self.check_grid_tensor(&hr)?;
        let dims = self.grid().dims();
        map_slices3(comm, hr, dims, || GridFft::forward(&dims), |fft, aux| {
            let mut aux = aux.to_owned();
            fft.process(&mut aux)?;
            Ok(aux)
        })
    }

    /// Evaluate `H(k) = Σ_R HR[R] exp(-2πi k·R) / w_R` at `kfrac` in crystal coordinates.
    ///
    /// Returns `(nawf, nawf, nspin)`. At grid nodes this reproduces the forward transform. Along an
    /// even axis the Nyquist lattice vector contributes the average of its `+n/2` and `-n/2`
    /// images, as in the zero-padded interpolation.
    pub fn hamiltonian_at(&self, hr: na::ArrayView6<c64>, kfrac: [f64; 3]) -> Result<na::Array3<c64>> {
        self.check_grid_tensor(&hr)?;
        Ok(self.sum_lattice(&hr, kfrac))
    }

    /// [`FourierEngine::hamiltonian_at`] for a list of k-points, `(nawf, nawf, nkpath, nspin)`.
    pub fn hamiltonian_path(&self, hr: na::ArrayView6<c64>, kpath: &[[f64; 3]]) -> Result<na::Array4<c64>> {
        self.check_grid_tensor(&hr)?;
        let (nawf, _, _, _, _, nspin) = hr.dim();

        let hks = kpath.par_iter()
            .map(|&kfrac| self.sum_lattice(&hr, kfrac))
            .collect::<Vec<_>>();

        let mut out = na::Array4::<c64>::zeros((nawf, nawf, kpath.len(), nspin));
        for (ik, hk) in hks.into_iter().enumerate() {
            out.slice_mut(na::s![.., .., ik, ..]).assign(&hk);
        }
        Ok(out)
    }

    fn sum_lattice(&self, hr: &na::ArrayView6<c64>, kfrac: [f64; 3]) -> na::Array3<c64> {
        let (nawf, _, _, _, _, nspin) = hr.dim();
        let grid = self.grid();
        let r_int = self.rgrid.r_int();
        let r_wght = self.rgrid.r_wght();

        let dims = grid.dims();

        let mut hk = na::Array3::<c64>::zeros((nawf, nawf, nspin));
        for (i, j, k) in iproduct!(0 .. grid.n1, 0 .. grid.n2, 0 .. grid.n3) {
            let n = grid.linear_index(i, j, k);
            let m = r_int[n];
            let mut phase = c64::new(1.0 / r_wght[n], 0.0);
            for (d, node) in [i, j, k].into_iter().enumerate() {
                let theta = -2.0 * PI * kfrac[d] * m[d] as f64;
                phase *= if is_nyquist(node, dims[d]) {
                    c64::new(theta.cos(), 0.0)
                } else {
                    c64::from_polar(1.0, theta)
                };
            }
            hk.scaled_add(phase, &hr.slice(na::s![.., .., i, j, k, ..]));
        }
        hk
    }
}
