use std::path::Path;

use anyhow::{
    ensure,
    Context,
};
use hdf5::File as H5File;
use log::{
    debug,
    info,
};
use ndarray as na;

use crate::{
    grid::{
        Grid,
        KIndex,
        normalize_weights,
    },
    types::{
        Result,
        c64,
        Vector,
        Matrix,
        Cube,
        Mat33,
    },
};


/// Result of a DFT calculation projected on the PAO basis.
///
/// Datasets of the HDF5 layout:
/// - kgrid: `[n1, n2, n3]`;
/// - alat: lattice parameter;
/// - a_vectors, b_vectors: direct and reciprocal lattice vectors, one per row, in units of
///   `alat` and `2π/alat`;
/// - kpnts: cartesian k-points `(nk, 3)` in units of `2π/alat`, kpnts_wght: their weights;
/// - efermi: Fermi level;
/// - eigs: `(nbnds, nk, nspin)`;
/// - U_r/U_i: projections `(nbnds, nawf, nk, nspin)`;
/// - S_r/S_i: optional orbital overlap `(nawf, nawf, nk)`.
#[derive(Debug, Clone)]
pub struct DftData {
    pub kgrid:      Grid,
    pub alat:       f64,
    pub a_vectors:  Mat33<f64>,
    pub b_vectors:  Mat33<f64>,
    pub kpnts:      Matrix<f64>,
    pub kpnts_wght: Vector<f64>,
    pub efermi:     f64,
    pub eigs:       Cube<f64>,
    pub u:          na::Array4<c64>,
    pub sks:        Option<Cube<c64>>,
}


fn to_mat33(m: &Matrix<f64>, name: &str) -> Result<Mat33<f64>> {
    ensure!(m.dim() == (3, 3), "Dataset `{}` must have shape (3, 3), got {:?}.", name, m.shape());
    let mut ret = [[0.0; 3]; 3];
    for ((i, j), v) in m.indexed_iter() {
        ret[i][j] = *v;
    }
    Ok(ret)
}


fn from_mat33(m: &Mat33<f64>) -> Matrix<f64> {
    Matrix::from_shape_fn((3, 3), |(i, j)| m[i][j])
}


fn combine<D: na::Dimension>(re: na::Array<f64, D>, im: na::Array<f64, D>, name: &str) -> Result<na::Array<c64, D>> {
    ensure!(re.shape() == im.shape(),
        "Real and imaginary parts of `{}` differ in shape: {:?} vs {:?}.", name, re.shape(), im.shape());
    Ok(na::Zip::from(&re).and(&im).map_collect(|r, i| c64::new(*r, *i)))
}


impl DftData {
    pub fn from_h5(path: &(impl AsRef<Path> + ?Sized)) -> Result<Self> {
        let path = path.as_ref();
        info!("Reading DFT data from {:?}", path);
        let f = H5File::open(path)
            .with_context(|| format!("Cannot open DFT data file {:?}", path))?;

        let kgrid = f.dataset("kgrid")?.read_raw::<usize>()?;
        ensure!(kgrid.len() == 3, "Dataset `kgrid` must hold 3 values, got {}.", kgrid.len());
        let kgrid = Grid::new(kgrid[0], kgrid[1], kgrid[2])?;

        let alat       = f.dataset("alat")?.read_scalar::<f64>()?;
        let a_vectors  = to_mat33(&f.dataset("a_vectors")?.read_2d::<f64>()?, "a_vectors")?;
        let b_vectors  = to_mat33(&f.dataset("b_vectors")?.read_2d::<f64>()?, "b_vectors")?;
        let kpnts      = f.dataset("kpnts")?.read_2d::<f64>()?;
        let kpnts_wght = f.dataset("kpnts_wght")?.read_1d::<f64>()?;
        let efermi     = f.dataset("efermi")?.read_scalar::<f64>()?;
        let eigs       = f.dataset("eigs")?.read::<f64, na::Ix3>()?;

        let u = combine(
            f.dataset("U_r")?.read::<f64, na::Ix4>()?,
            f.dataset("U_i")?.read::<f64, na::Ix4>()?,
            "U")?;

        let sks = if f.link_exists("S_r") {
            Some(combine(
                f.dataset("S_r")?.read::<f64, na::Ix3>()?,
                f.dataset("S_i")?.read::<f64, na::Ix3>()?,
                "S")?)
        } else {
            None
        };

        let ret = Self { kgrid, alat, a_vectors, b_vectors, kpnts, kpnts_wght, efermi, eigs, u, sks };
        ret.validate()?;

        let (nbnds, nawf, nkpnts, nspin) = ret.u.dim();
        info!("Found {} bands, {} orbitals, {} k-points on the {} grid, {} spin(s), overlap {}.",
            nbnds, nawf, nkpnts, kgrid, nspin, if ret.sks.is_some() { "present" } else { "absent" });
        Ok(ret)
    }

    pub fn to_h5(&self, path: &(impl AsRef<Path> + ?Sized)) -> Result<()> {
        let f = H5File::create(path)?;

        f.new_dataset_builder().with_data(&na::arr1(&self.kgrid.dims())).create("kgrid")?;
        f.new_dataset::<f64>().create("alat")?.write_scalar(&self.alat)?;
        f.new_dataset_builder().with_data(&from_mat33(&self.a_vectors)).create("a_vectors")?;
        f.new_dataset_builder().with_data(&from_mat33(&self.b_vectors)).create("b_vectors")?;
        f.new_dataset_builder().with_data(&self.kpnts).create("kpnts")?;
        f.new_dataset_builder().with_data(&self.kpnts_wght).create("kpnts_wght")?;
        f.new_dataset::<f64>().create("efermi")?.write_scalar(&self.efermi)?;
        f.new_dataset_builder().with_data(&self.eigs).create("eigs")?;

        f.new_dataset_builder().with_data(&self.u.mapv(|v| v.re)).create("U_r")?;
        f.new_dataset_builder().with_data(&self.u.mapv(|v| v.im)).create("U_i")?;

        if let Some(sks) = self.sks.as_ref() {
            f.new_dataset_builder().with_data(&sks.mapv(|v| v.re)).create("S_r")?;
            f.new_dataset_builder().with_data(&sks.mapv(|v| v.im)).create("S_i")?;
        }

        debug!("DFT data written to {:?}", path.as_ref());
        Ok(())
    }

    /// Shape consistency between all datasets.
    pub fn validate(&self) -> Result<()> {
        let (nbnds, nawf, nkpnts, nspin) = self.u.dim();
        ensure!(nbnds > 0 && nawf > 0, "Projections are empty: {} bands, {} orbitals.", nbnds, nawf);
        ensure!(nspin == 1 || nspin == 2, "Number of spin channels must be 1 or 2, got {}.", nspin);
        ensure!(nawf <= nbnds, "Cannot project {} bands onto {} orbitals, more bands are needed.", nbnds, nawf);
        ensure!(nkpnts == self.kgrid.nktot(),
            "Grid {} needs {} k-points, projections hold {}.", self.kgrid, self.kgrid.nktot(), nkpnts);
        ensure!(self.eigs.dim() == (nbnds, nkpnts, nspin),
            "Eigenvalues have shape {:?}, projections need ({}, {}, {}).", self.eigs.shape(), nbnds, nkpnts, nspin);
        ensure!(self.kpnts.dim() == (nkpnts, 3),
            "K-points have shape {:?}, expected ({}, 3).", self.kpnts.shape(), nkpnts);
        ensure!(self.kpnts_wght.len() == nkpnts,
            "Got {} k-point weights for {} k-points.", self.kpnts_wght.len(), nkpnts);
        if let Some(sks) = self.sks.as_ref() {
            ensure!(sks.dim() == (nawf, nawf, nkpnts),
                "Overlap has shape {:?}, expected ({}, {}, {}).", sks.shape(), nawf, nawf, nkpnts);
        }
        Ok(())
    }

    pub fn nawf(&self) -> usize {
        self.u.dim().1
    }

    pub fn nbnds(&self) -> usize {
        self.u.dim().0
    }

    pub fn nkpnts(&self) -> usize {
        self.u.dim().2
    }

    pub fn nspin(&self) -> usize {
        self.u.dim().3
    }

    /// Index table between the k-grid and the k-point list, after checking the weights describe
    /// the full grid.
    pub fn kindex(&self) -> Result<KIndex> {
        normalize_weights(self.kpnts_wght.view(), self.kgrid)?;
        KIndex::from_cartesian(self.kgrid, self.kpnts.view(), &self.b_vectors)
    }

    /// Eigenvalues relative to the Fermi level.
    pub fn relative_eigs(&self) -> Cube<f64> {
        self.eigs.mapv(|e| e - self.efermi)
    }
}


#[cfg(test)]
mod test {
    use super::*;

    /// Two orbitals, three bands, on a 2x1x1 grid of a cubic lattice.
    fn toy_data() -> DftData {
        let kgrid = Grid::new(2, 1, 1).unwrap();
        let eye = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        let mut u = na::Array4::<c64>::zeros((3, 2, 2, 1));
        for ik in 0 .. 2 {
            u[[0, 0, ik, 0]] = c64::new(1.0, 0.0);
            u[[1, 1, ik, 0]] = c64::new(0.0, 1.0);
        }
        DftData {
            kgrid,
            alat: 5.0,
            a_vectors: eye,
            b_vectors: eye,
            kpnts: na::arr2(&[[0.5, 0.0, 0.0], [0.0, 0.0, 0.0]]),
            kpnts_wght: na::arr1(&[1.0, 1.0]),
            efermi: 0.5,
            eigs: na::Array3::from_shape_fn((3, 2, 1), |(n, k, _)| n as f64 + 0.25 * k as f64),
            u,
            sks: None,
        }
    }

    #[test]
    fn test_validate() {
        let data = toy_data();
        data.validate().unwrap();
        assert_eq!((data.nbnds(), data.nawf(), data.nkpnts(), data.nspin()), (3, 2, 2, 1));

        let mut bad = data.clone();
        bad.eigs = na::Array3::zeros((3, 2, 2));
        assert!(bad.validate().is_err());

        let mut bad = data.clone();
        bad.sks = Some(na::Array3::zeros((2, 2, 3)));
        assert!(bad.validate().is_err());

        let mut bad = data;
        bad.kgrid = Grid::new(3, 1, 1).unwrap();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_kindex_and_eigs() {
        let data = toy_data();
        let kindex = data.kindex().unwrap();
        assert_eq!(kindex.get(0, 0, 0), 1);
        assert_eq!(kindex.get(1, 0, 0), 0);

        let rel = data.relative_eigs();
        assert_eq!(rel[[0, 0, 0]], -0.5);

        let mut reduced = data;
        reduced.kpnts_wght = na::arr1(&[1.0, 3.0]);
        assert!(reduced.kindex().is_err());
    }
}
