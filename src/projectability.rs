//! Projectability of DFT bands onto the PAO basis and construction of the TB Hamiltonian.
//!
//! Projection coefficients are laid out as `U[band, orbital, k, spin]`, eigenvalues as
//! `eigs[band, k, spin]`, and the Hamiltonian as `Hks[orbital, orbital, k, spin]`.
use std::fmt;

use anyhow::{
    bail,
    ensure,
};
use log::debug;
use ndarray as na;
use serde::{
    Serialize,
    Deserialize,
};

use crate::types::{
    Result,
    c64,
    Vector,
    Matrix,
};


/// How states outside the projectable subspace are pushed out of the energy window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ShiftType {
    /// `H = A E A†`.
    None,
    /// `H = A E A†`, plus `shift * (1 - (A A†)_ii)` on the diagonal only.
    Diagonal,
    /// `H = A E A† + shift * (I - A A†)`.
    Full,
}


impl TryFrom<u8> for ShiftType {
    type Error = String;

    fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::None),
            1 => Ok(Self::Diagonal),
            2 => Ok(Self::Full),
            _ => Err(format!("shift_type {} not recognized, available values are 0, 1 and 2", v)),
        }
    }
}


impl From<ShiftType> for u8 {
    fn from(s: ShiftType) -> Self {
        match s {
            ShiftType::None     => 0,
            ShiftType::Diagonal => 1,
            ShiftType::Full     => 2,
        }
    }
}


impl ShiftType {
    /// Energy the null-space states are pushed up by, zero when no shift is applied.
    pub fn applied_shift(&self, shift: f64) -> f64 {
        match self {
            Self::None => 0.0,
            Self::Diagonal | Self::Full => shift,
        }
    }
}


impl fmt::Display for ShiftType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = match self {
            Self::None     => "no shift",
            Self::Diagonal => "diagonal shift",
            Self::Full     => "full-matrix shift",
        };
        f.write_str(description)
    }
}


/// Projectability `Pn[band] = Σ_{orbital} |U[band, orbital, k, spin]|²` averaged over k-points and spins.
pub fn build_pn(u: na::ArrayView4<c64>) -> Result<Vector<f64>> {
    let (nbnds, nawf, nkpnts, nspin) = u.dim();
    ensure!(nbnds > 0 && nawf > 0, "Projections are empty: {} bands, {} orbitals.", nbnds, nawf);
    ensure!(nkpnts > 0 && nspin > 0, "Projections are empty: {} k-points, {} spins.", nkpnts, nspin);

    let scale = 1.0 / (nkpnts * nspin) as f64;
    let pn = u.outer_iter()
        .map(|band| band.iter().map(|v| v.norm_sqr()).sum::<f64>() * scale)
        .collect::<Vector<f64>>();
    Ok(pn)
}


/// Number of bands whose projectability exceeds `pthr`.
pub fn count_projectable(pn: &Vector<f64>, pthr: f64) -> Result<usize> {
    let bnd = pn.iter().filter(|p| **p > pthr).count();
    if bnd == 0 {
        bail!("No band has projectability above {}, the PAO basis cannot represent this system.", pthr);
    }
    Ok(bnd)
}


/// Parameters of the Hamiltonian construction.
#[derive(Debug, Clone, Copy)]
pub struct HamiltonianParams {
    /// Number of leading bands kept, from [`count_projectable`].
    pub bnd:        usize,
    /// Number of leading bands whose projections are normalized, usually `nawf`.
    pub nbnds_norm: usize,
    pub shift:      f64,
    pub shift_type: ShiftType,
}


/// Build `Hks[i, j, k, spin] = Σ_n A[i, n] E[n] A*[j, n]` from the normalized projections of the
/// kept bands, plus the energy shift selected by `shift_type`.
///
/// With an active shift, only bands among the first `bnd` with eigenvalue not above `shift` enter
/// at each k-point. Eigenvalues are expected relative to the Fermi level.
pub fn build_hks(u: na::ArrayView4<c64>, eigs: na::ArrayView3<f64>, params: &HamiltonianParams) -> Result<na::Array4<c64>> {
    let (nbnds, nawf, nkpnts, nspin) = u.dim();
    ensure!(eigs.dim() == (nbnds, nkpnts, nspin),
        "Eigenvalues have shape {:?}, but projections need ({}, {}, {}).", eigs.shape(), nbnds, nkpnts, nspin);
    ensure!(params.bnd > 0 && params.bnd <= nbnds,
        "Number of kept bands {} is out of range 1 ..= {}.", params.bnd, nbnds);
    ensure!(params.nbnds_norm <= nbnds.max(nawf),
        "Cannot normalize {} bands with only {} bands and {} orbitals.", params.nbnds_norm, nbnds, nawf);

    let nbnds_norm = params.nbnds_norm.min(nbnds);
    let mut hks = na::Array4::<c64>::zeros((nawf, nawf, nkpnts, nspin));

    for ispin in 0 .. nspin {
        for ik in 0 .. nkpnts {
            let my_eigs = eigs.slice(na::s![.., ik, ispin]);

            // columns are the projected bands
            let mut uu: Matrix<c64> = u.slice(na::s![.., .., ik, ispin]).t().to_owned();
            for mut col in uu.columns_mut().into_iter().take(nbnds_norm) {
                let norm = col.iter().map(|v| v.norm_sqr()).sum::<f64>().sqrt();
                if norm > 0.0 {
                    col.mapv_inplace(|v| v / norm);
                }
            }

            let selected = (0 .. params.bnd)
                .filter(|&n| params.shift_type == ShiftType::None || my_eigs[n] <= params.shift)
                .collect::<Vec<usize>>();
            if selected.is_empty() {
                bail!("No eigenvalue below the shift {} at k-point #{}, spin {}.", params.shift, ik + 1, ispin + 1);
            }

            let ac = uu.select(na::Axis(1), &selected);
            let ac_dag = ac.t().mapv(|v| v.conj());
            let mut ae = ac.clone();
            for (mut col, &n) in ae.columns_mut().into_iter().zip(selected.iter()) {
                let e = my_eigs[n];
                col.mapv_inplace(|v| v * e);
            }
            let mut h = ae.dot(&ac_dag);

            match params.shift_type {
                ShiftType::None => (),
                ShiftType::Diagonal => {
                    let proj = ac.dot(&ac_dag);
                    for i in 0 .. nawf {
                        h[(i, i)] += params.shift * (1.0 - proj[(i, i)].re);
                    }
                },
                ShiftType::Full => {
                    let proj = ac.dot(&ac_dag);
                    let eye = Matrix::<c64>::eye(nawf);
                    h = h + (eye - proj).mapv(|v| v * params.shift);
                },
            }

            hks.slice_mut(na::s![.., .., ik, ispin]).assign(&h);
        }
    }

    debug!("TB Hamiltonian built: {} orbitals, {} k-points, {} spins, {}", nawf, nkpnts, nspin, params.shift_type);
    Ok(hks)
}


#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::{
        DMatrix,
        SymmetricEigen,
    };
    use rand::{
        Rng,
        SeedableRng,
        rngs::StdRng,
    };

    /// Random unitary matrix from the eigenvectors of a random Hermitian one.
    fn random_unitary(n: usize, rng: &mut StdRng) -> Matrix<c64> {
        let mut h = DMatrix::<c64>::zeros(n, n);
        for i in 0 .. n {
            for j in i .. n {
                let v = c64::new(rng.gen_range(-1.0 .. 1.0), if i == j { 0.0 } else { rng.gen_range(-1.0 .. 1.0) });
                h[(i, j)] = v;
                h[(j, i)] = v.conj();
            }
        }
        let q = SymmetricEigen::new(h).eigenvectors;
        Matrix::from_shape_fn((n, n), |(i, j)| q[(i, j)])
    }

    /// Projections of `nbnds` orthonormal states onto `nawf` orthonormal orbitals.
    fn random_projections(nbnds: usize, nawf: usize, nkpnts: usize, nspin: usize, seed: u64) -> na::Array4<c64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut u = na::Array4::<c64>::zeros((nbnds, nawf, nkpnts, nspin));
        for ispin in 0 .. nspin {
            for ik in 0 .. nkpnts {
                let q = random_unitary(nbnds, &mut rng);
                u.slice_mut(na::s![.., .., ik, ispin]).assign(&q.slice(na::s![.., .. nawf]));
            }
        }
        u
    }

    fn is_hermitian(h: na::ArrayView2<c64>, tol: f64) -> bool {
        h.indexed_iter().all(|((i, j), v)| (v - h[(j, i)].conj()).norm() < tol)
    }

    #[test]
    fn test_shift_type_conversion() {
        assert_eq!(ShiftType::try_from(0u8).unwrap(), ShiftType::None);
        assert_eq!(ShiftType::try_from(2u8).unwrap(), ShiftType::Full);
        assert!(ShiftType::try_from(3u8).is_err());
        assert_eq!(u8::from(ShiftType::Diagonal), 1);

        assert_eq!(ShiftType::None.applied_shift(20.0), 0.0);
        assert_eq!(ShiftType::Full.applied_shift(20.0), 20.0);
    }

    #[test]
    fn test_pn_bounds() {
        let u = random_projections(8, 5, 3, 2, 42);
        let pn = build_pn(u.view()).unwrap();
        assert_eq!(pn.len(), 8);
        assert!(pn.iter().all(|p| *p >= 0.0 && *p <= 1.0 + 1E-12));
        // the orbitals span 5 of 8 dimensions
        assert_abs_diff_eq!(pn.sum(), 5.0, epsilon = 1E-10);
    }

    #[test]
    fn test_bnd_monotonic() {
        let u = random_projections(10, 6, 2, 1, 7);
        let pn = build_pn(u.view()).unwrap();
        let mut last = usize::MAX;
        for i in 0 .. 20 {
            let pthr = i as f64 * 0.05 - 0.01;
            let bnd = match count_projectable(&pn, pthr) {
                Ok(n) => n,
                Err(_) => 0,
            };
            assert!(bnd <= last);
            last = bnd;
        }
        assert!(count_projectable(&pn, 1.5).is_err());
    }

    #[test]
    fn test_identity_projection() {
        // bands coincide with orbitals: H = diag(eigs)
        let (nawf, nkpnts) = (3, 2);
        let mut u = na::Array4::<c64>::zeros((nawf, nawf, nkpnts, 1));
        let mut eigs = na::Array3::<f64>::zeros((nawf, nkpnts, 1));
        for ik in 0 .. nkpnts {
            for n in 0 .. nawf {
                u[[n, n, ik, 0]] = c64::new(0.5, 0.0);  // normalized away
                eigs[[n, ik, 0]] = n as f64 - 1.0 + ik as f64;
            }
        }

        let params = HamiltonianParams { bnd: nawf, nbnds_norm: nawf, shift: 0.0, shift_type: ShiftType::None };
        let hks = build_hks(u.view(), eigs.view(), &params).unwrap();
        for ik in 0 .. nkpnts {
            for i in 0 .. nawf {
                for j in 0 .. nawf {
                    let expected = if i == j { eigs[[i, ik, 0]] } else { 0.0 };
                    assert_abs_diff_eq!(hks[[i, j, ik, 0]].re, expected, epsilon = 1E-12);
                    assert_abs_diff_eq!(hks[[i, j, ik, 0]].im, 0.0, epsilon = 1E-12);
                }
            }
        }

        // drop the top band and push it to the shift
        let params = HamiltonianParams { bnd: 2, nbnds_norm: nawf, shift: 10.0, shift_type: ShiftType::Full };
        let hks = build_hks(u.view(), eigs.view(), &params).unwrap();
        assert_abs_diff_eq!(hks[[0, 0, 0, 0]].re, -1.0, epsilon = 1E-12);
        assert_abs_diff_eq!(hks[[1, 1, 0, 0]].re,  0.0, epsilon = 1E-12);
        assert_abs_diff_eq!(hks[[2, 2, 0, 0]].re, 10.0, epsilon = 1E-12);
    }

    #[test]
    fn test_shift_variants_hermitian() {
        let (nbnds, nawf) = (9, 5);
        let u = random_projections(nbnds, nawf, 2, 2, 3);
        let eigs = na::Array3::from_shape_fn((nbnds, 2, 2), |(n, k, s)| n as f64 * 0.7 - 2.0 + 0.1 * (k + s) as f64);

        for shift_type in [ShiftType::None, ShiftType::Diagonal, ShiftType::Full] {
            let params = HamiltonianParams { bnd: 4, nbnds_norm: nawf, shift: 5.0, shift_type };
            let hks = build_hks(u.view(), eigs.view(), &params).unwrap();
            assert_eq!(hks.dim(), (nawf, nawf, 2, 2));
            for ik in 0 .. 2 {
                for ispin in 0 .. 2 {
                    assert!(is_hermitian(hks.slice(na::s![.., .., ik, ispin]), 1E-10));
                }
            }
        }

        // the diagonal-only shift agrees with the full one on the diagonal
        let diag = build_hks(u.view(), eigs.view(),
            &HamiltonianParams { bnd: 4, nbnds_norm: nawf, shift: 5.0, shift_type: ShiftType::Diagonal }).unwrap();
        let full = build_hks(u.view(), eigs.view(),
            &HamiltonianParams { bnd: 4, nbnds_norm: nawf, shift: 5.0, shift_type: ShiftType::Full }).unwrap();
        for i in 0 .. nawf {
            assert_abs_diff_eq!(diag[[i, i, 1, 0]].re, full[[i, i, 1, 0]].re, epsilon = 1E-10);
        }
    }

    #[test]
    fn test_build_hks_errors() {
        let u = random_projections(4, 3, 2, 1, 11);
        let eigs = na::Array3::<f64>::zeros((4, 3, 1));
        let params = HamiltonianParams { bnd: 2, nbnds_norm: 3, shift: 1.0, shift_type: ShiftType::None };
        assert!(build_hks(u.view(), eigs.view(), &params).is_err());

        let eigs = na::Array3::<f64>::from_elem((4, 2, 1), 5.0);
        let params = HamiltonianParams { bnd: 2, nbnds_norm: 3, shift: 1.0, shift_type: ShiftType::Full };
        assert!(build_hks(u.view(), eigs.view(), &params).is_err());

        let params = HamiltonianParams { bnd: 0, nbnds_norm: 3, shift: 1.0, shift_type: ShiftType::None };
        assert!(build_hks(u.view(), eigs.view(), &params).is_err());
    }
}
