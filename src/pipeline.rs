//! Stage orchestration: projection -> basis correction -> k to R -> interpolation -> consumers.
use std::{
    path::Path,
    thread,
};

use anyhow::{
    anyhow,
    ensure,
    Context,
};
use hdf5::File as H5File;
use log::{
    info,
    debug,
};
use ndarray as na;

use crate::{
    basis::{
        Basis,
        BasisCorrection,
    },
    comm::{
        Comm,
        SerialComm,
        ThreadComm,
    },
    dft_data::DftData,
    fourier::FourierEngine,
    grid::Grid,
    interp::{
        flatten_grid,
        interpolate_path,
        interpolate_volume,
    },
    projectability::{
        HamiltonianParams,
        build_hks,
        build_pn,
        count_projectable,
    },
    settings::Settings,
    spectrum::{
        EigComparison,
        smeared_dos,
        tb_eigenvalues,
    },
    types::{
        Result,
        c64,
        Vector,
        Cube,
    },
};


/// Everything the pipeline hands to the writers.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Projectability of every DFT band.
    pub pn:          Vector<f64>,
    /// Number of bands above the projectability threshold.
    pub bnd:         usize,
    /// Grid of `hksp`, the DFT grid when no padding is requested.
    pub grid:        Grid,
    /// Interpolated Hamiltonian `(nawf, nawf, n1, n2, n3, nspin)`.
    pub hksp:        na::Array6<c64>,
    /// Interpolated overlap `(nawf, nawf, n1, n2, n3, 1)`, non-orthogonal basis only.
    pub sksp:        Option<na::Array6<c64>>,
    /// Eigenvalues along the zero-padded path, `(nawf, nL + npad, nspin)`.
    pub bands:       Option<Cube<f64>>,
    /// Eigenvalues at the explicit k-points, `(nawf, nkpath, nspin)`.
    pub kpath_bands: Option<Cube<f64>>,
    /// Energies and DOS, root worker only.
    pub dos:         Option<(Vector<f64>, Vector<f64>)>,
    pub comparison:  Option<EigComparison>,
}


impl PipelineOutput {
    pub fn to_h5(&self, path: &(impl AsRef<Path> + ?Sized)) -> Result<()> {
        let f = H5File::create(path)?;

        f.new_dataset_builder().with_data(&na::arr1(&self.grid.dims())).create("kgrid")?;
        f.new_dataset_builder().with_data(&self.hksp.mapv(|v| v.re)).create("Hk_r")?;
        f.new_dataset_builder().with_data(&self.hksp.mapv(|v| v.im)).create("Hk_i")?;

        if let Some(sksp) = self.sksp.as_ref() {
            let sksp = sksp.index_axis(na::Axis(5), 0);
            f.new_dataset_builder().with_data(&sksp.mapv(|v| v.re)).create("Sk_r")?;
            f.new_dataset_builder().with_data(&sksp.mapv(|v| v.im)).create("Sk_i")?;
        }
        Ok(())
    }
}


pub struct Pipeline {
    settings: Settings,
    data:     DftData,
    basis:    Basis,
}


impl Pipeline {
    pub fn new(settings: Settings, data: DftData) -> Result<Self> {
        settings.validate()?;
        data.validate()?;
        ensure!(!settings.read_s || data.sks.is_some(),
            "`read_S` is set but the DFT data holds no overlap (datasets `S_r`/`S_i`).");
        let basis = Basis::select(settings.read_s);
        Ok(Self { settings, data, basis })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn data(&self) -> &DftData {
        &self.data
    }

    /// Run with `nworkers` threads, each owning one worker of a [`ThreadComm`] group, and return
    /// the result of the root worker.
    pub fn execute(&self) -> Result<PipelineOutput> {
        let nworkers = self.settings.nworkers;
        if nworkers == 1 {
            return self.run(&SerialComm);
        }

        info!("Running with {} workers", nworkers);
        let group = ThreadComm::group(nworkers)?;
        let mut results = thread::scope(|s| {
            let handles = group.into_iter()
                .map(|comm| s.spawn(move || self.run(&comm)))
                .collect::<Vec<_>>();
            handles.into_iter()
                .map(|h| h.join())
                .collect::<Vec<_>>()
        });

        results.swap_remove(0)
            .map_err(|_| anyhow!("Root worker panicked."))?
    }

    pub fn run<C: Comm>(&self, comm: &C) -> Result<PipelineOutput> {
        let root = comm.is_root();
        let settings = &self.settings;
        let (nbnds, nawf, nkpnts, nspin) = self.data.u.dim();

        // fatal grid checks come before any heavy work
        let kindex = self.data.kindex()?;
        let engine = FourierEngine::new(kindex, &self.data.a_vectors)?;
        let grid = engine.grid();

        let pn = build_pn(self.data.u.view())?;
        let bnd = count_projectable(&pn, settings.pthr)?;
        if root {
            info!("{} of {} bands have projectability above {}", bnd, nbnds, settings.pthr);
        }

        let params = HamiltonianParams {
            bnd,
            nbnds_norm: nawf,
            shift:      settings.shift,
            shift_type: settings.shift_type,
        };
        let eigs = self.data.relative_eigs();
        let sks = match self.data.sks.as_ref() {
            Some(sks) if !self.basis.is_orthogonal() => sks.clone(),
            _ => identity_overlap(nawf, nkpnts),
        };

        let hks = comm.agree(self.build_local(comm, &eigs, sks.view(), &params))?;
        let hks = comm.all_reduce_sum(hks)?;
        if root {
            info!("TB Hamiltonian built on {} k-points, {} spin(s), {}", nkpnts, nspin, settings.shift_type);
        }

        let comparison = if settings.do_comparison {
            let sk = (!self.basis.is_orthogonal()).then(|| sks.view());
            let tb = distributed_eigenvalues(comm, hks.view(), sk)?;
            let cmp = EigComparison::new(tb.view(), eigs.view(), bnd.min(nawf))?;
            if root {
                info!("Max deviation between TB and DFT eigenvalues: {:.6} eV", cmp.max_abs_diff());
            }
            Some(cmp)
        } else {
            None
        };

        let hk = engine.to_grid(hks.view())?;
        drop(hks);
        let hr = engine.k_to_r(comm, hk.view())?;
        drop(hk);

        let sr = if self.basis.is_orthogonal() {
            None
        } else {
            let sk = engine.to_grid(sks.view().insert_axis(na::Axis(3)))?;
            Some(engine.k_to_r(comm, sk.view())?)
        };
        drop(sks);
        if root {
            info!("Real-space Hamiltonian ready on {} lattice vectors", engine.rgrid().nrtot());
        }

        let kpath_bands = if settings.kpath.is_empty() {
            None
        } else {
            let hk = engine.hamiltonian_path(hr.view(), &settings.kpath)?;
            let sk = sr.as_ref()
                .map(|sr| engine.hamiltonian_path(sr.view(), &settings.kpath))
                .transpose()?;
            let sk = sk.as_ref().map(|s| s.index_axis(na::Axis(3), 0));
            Some(distributed_eigenvalues(comm, hk.view(), sk)?)
        };

        let pad = settings.padding();
        let dense = grid.padded(pad);
        let hksp = interpolate_volume(comm, hr.view(), pad)?;
        drop(hr);
        let sksp = sr.map(|sr| interpolate_volume(comm, sr.view(), pad)).transpose()?;
        if root && dense != grid {
            info!("Hamiltonian interpolated from {} to {} k-points ({})", grid.nktot(), dense.nktot(), dense);
        }

        let bands = if settings.do_bands {
            let hpath = interpolate_path(comm, flatten_grid(hksp.view())?.view(), settings.npad)?;
            let spath = sksp.as_ref()
                .map(|s| -> Result<_> { interpolate_path(comm, flatten_grid(s.view())?.view(), settings.npad) })
                .transpose()?;
            let sk = spath.as_ref().map(|s| s.index_axis(na::Axis(3), 0));
            let bands = distributed_eigenvalues(comm, hpath.view(), sk)?;
            if root {
                info!("Band path interpolated on {} points", bands.dim().1);
            }
            Some(bands)
        } else {
            None
        };

        let dos = if settings.do_dos {
            let hflat = flatten_grid(hksp.view())?;
            let sflat = sksp.as_ref().map(|s| flatten_grid(s.view())).transpose()?;
            let sk = sflat.as_ref().map(|s| s.index_axis(na::Axis(3), 0));
            let tb = distributed_eigenvalues(comm, hflat.view(), sk)?;
            let shift = settings.shift_type.applied_shift(settings.shift);
            smeared_dos(comm, tb.view(), settings.smearing, settings.delta, shift)?
        } else {
            None
        };

        Ok(PipelineOutput {
            pn,
            bnd,
            grid: dense,
            hksp,
            sksp,
            bands,
            kpath_bands,
            dos,
            comparison,
        })
    }

    /// Hamiltonian of this worker's k-points, basis corrected, in a full-size zero tensor.
    fn build_local<C: Comm>(&self, comm: &C, eigs: &Cube<f64>, sks: na::ArrayView3<c64>, params: &HamiltonianParams) -> Result<na::Array4<c64>> {
        let (_, nawf, nkpnts, nspin) = self.data.u.dim();
        let (start, end) = comm.partition(nkpnts)?;
        debug!("Worker {} builds k-points {} .. {}", comm.rank(), start, end);

        let part = build_hks(
            self.data.u.slice(na::s![.., .., start .. end, ..]),
            eigs.slice(na::s![.., start .. end, ..]),
            params)
            .with_context(|| format!("Hamiltonian construction failed on k-points #{} ..= #{}", start + 1, end))?;
        let part = self.basis.correct(part, sks.slice(na::s![.., .., start .. end]))?;

        let mut full = na::Array4::<c64>::zeros((nawf, nawf, nkpnts, nspin));
        full.slice_mut(na::s![.., .., start .. end, ..]).assign(&part);
        Ok(full)
    }
}


fn identity_overlap(nawf: usize, nkpnts: usize) -> Cube<c64> {
    na::Array3::from_shape_fn((nawf, nawf, nkpnts), |(i, j, _)| {
        if i == j { c64::new(1.0, 0.0) } else { c64::new(0.0, 0.0) }
    })
}


/// TB eigenvalues with the k-points partitioned over the workers, gathered on every worker.
fn distributed_eigenvalues<C: Comm>(comm: &C, hk: na::ArrayView4<c64>, sk: Option<na::ArrayView3<c64>>) -> Result<Cube<f64>> {
    let (nawf, _, nk, nspin) = hk.dim();
    let (start, end) = comm.partition(nk)?;

    let local = tb_eigenvalues(
        hk.slice(na::s![.., .., start .. end, ..]),
        sk.map(|s| s.slice_move(na::s![.., .., start .. end])))
        .map(|part| {
            let mut full = Cube::<f64>::zeros((nawf, nk, nspin));
            full.slice_mut(na::s![.., start .. end, ..]).assign(&part);
            full
        });

    let local = comm.agree(local)?;
    comm.all_reduce_sum(local)
}


#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use crate::{
        projectability::ShiftType,
        spectrum::NDOS,
    };

    /// Two orbitals, two bands, cosine band on a 4x1x1 grid.
    fn cosine_data() -> DftData {
        let kgrid = Grid::new(4, 1, 1).unwrap();
        let eye = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        let mut u = na::Array4::<c64>::zeros((2, 2, 4, 1));
        let mut eigs = na::Array3::<f64>::zeros((2, 4, 1));
        let mut kpnts = na::Array2::<f64>::zeros((4, 3));
        for ik in 0 .. 4 {
            let k = ik as f64 / 4.0;
            kpnts[[ik, 0]] = k;
            u[[0, 0, ik, 0]] = c64::new(1.0, 0.0);
            u[[1, 1, ik, 0]] = c64::new(1.0, 0.0);
            eigs[[0, ik, 0]] = -1.0 - (2.0 * std::f64::consts::PI * k).cos();
            eigs[[1, ik, 0]] = 2.0;
        }
        DftData {
            kgrid,
            alat: 1.0,
            a_vectors: eye,
            b_vectors: eye,
            kpnts,
            kpnts_wght: na::Array1::from_elem(4, 0.25),
            efermi: 0.0,
            eigs,
            u,
            sks: None,
        }
    }

    #[test]
    fn test_pipeline_cosine_band() {
        let settings = Settings {
            shift_type: ShiftType::None,
            pthr: 0.5,
            double_grid: true,
            nfft1: 4,
            do_comparison: true,
            kpath: vec![[0.125, 0.0, 0.0]],
            ..Settings::default()
        };
        let pipeline = Pipeline::new(settings, cosine_data()).unwrap();
        let out = pipeline.run(&SerialComm).unwrap();

        assert_eq!(out.bnd, 2);
        assert_eq!(out.grid, Grid::new(8, 1, 1).unwrap());
        for i in 0 .. 8 {
            let k = i as f64 / 8.0;
            assert_abs_diff_eq!(out.hksp[[0, 0, i, 0, 0, 0]].re, -1.0 - (2.0 * std::f64::consts::PI * k).cos(), epsilon = 1E-10);
            assert_abs_diff_eq!(out.hksp[[1, 1, i, 0, 0, 0]].re, 2.0, epsilon = 1E-10);
        }

        let kpath = out.kpath_bands.unwrap();
        assert_abs_diff_eq!(kpath[[0, 0, 0]], -1.0 - (std::f64::consts::PI / 4.0).cos(), epsilon = 1E-10);
        assert_abs_diff_eq!(out.comparison.unwrap().max_abs_diff(), 0.0, epsilon = 1E-10);
        assert!(out.sksp.is_none());
    }

    #[test]
    fn test_pipeline_dos_without_shift() {
        let settings = Settings {
            shift_type: ShiftType::None,
            do_dos: true,
            ..Settings::default()
        };
        let pipeline = Pipeline::new(settings, cosine_data()).unwrap();
        let (ene, dos) = pipeline.run(&SerialComm).unwrap().dos.unwrap();

        // the window spans every eigenvalue, nothing was shifted away
        assert_eq!(dos.len(), NDOS);
        assert_abs_diff_eq!(ene[0], -2.0, epsilon = 1E-10);
        assert!(ene[NDOS - 1] > 1.99);
        assert!(dos.iter().all(|d| *d >= 0.0));
    }

    #[test]
    fn test_pipeline_missing_overlap() {
        let settings = Settings { read_s: true, ..Settings::default() };
        assert!(Pipeline::new(settings, cosine_data()).is_err());
    }

    #[test]
    fn test_pipeline_nothing_projectable() {
        let mut data = cosine_data();
        data.u.mapv_inplace(|v| v * 0.1);
        let pipeline = Pipeline::new(Settings::default(), data).unwrap();
        assert!(pipeline.run(&SerialComm).is_err());
    }
}
