use std::{
    fs,
    path::PathBuf,
};

use clap::Args;
use anyhow::Context;
use log::info;

use crate::{
    OptProcess,
    commands::common::{
        write_bands_to_txt,
        write_columns,
    },
    dft_data::DftData,
    pipeline::{
        Pipeline,
        PipelineOutput,
    },
    settings::Settings,
    types::{
        Result,
        Vector,
    },
};


#[derive(Debug, Args)]
/// Build the TB Hamiltonian from projected DFT data and run the requested consumers.
///
/// Output files, all placed in `outdir`:{n}
/// - projectability.dat: projectability of every DFT band;{n}
/// - comparison.dat: TB against DFT eigenvalues, when `do_comparison` is set;{n}
/// - bands.dat: eigenvalues along the zero-padded path, when `do_bands` is set;{n}
/// - bands_kpath.dat: eigenvalues at the k-points listed in `kpath`;{n}
/// - dos.dat: smeared density of states, when `do_dos` is set;{n}
/// - hamiltonian.h5: interpolated Hamiltonian (and overlap), when `write_h5` is set.
///
/// Energies are in eV relative to the Fermi level.
pub struct Run {
    #[arg(short, long, default_value = "./rspao.toml")]
    /// Configuration file, run `rspao template` to get one.
    config: PathBuf,
}


impl OptProcess for Run {
    fn process(&self) -> Result<()> {
        info!("Reading configuration from {:?}", &self.config);
        let settings = Settings::from_file(&self.config)?;
        let data = DftData::from_h5(&settings.fpath)?;

        let pipeline = Pipeline::new(settings, data)?;
        let output = pipeline.execute()?;

        write_output(pipeline.settings(), &output)
    }
}


fn write_output(settings: &Settings, output: &PipelineOutput) -> Result<()> {
    let outdir = &settings.outdir;
    fs::create_dir_all(outdir)
        .with_context(|| format!("Cannot create output directory {:?}", outdir))?;

    let fname = outdir.join("projectability.dat");
    let index = Vector::from_shape_fn(output.pn.len(), |i| (i + 1) as f64);
    write_columns(&fname, &[&index, &output.pn], "band  Pn")?;
    info!("Projectability written to {:?}", fname);

    if let Some(cmp) = output.comparison.as_ref() {
        let fname = outdir.join("comparison.dat");
        write_columns(&fname, &cmp.columns(), "kpoint  spin  band  E_DFT  E_TB  E_TB-E_DFT")?;
        info!("Eigenvalue comparison written to {:?}", fname);
    }

    if let Some(bands) = output.bands.as_ref() {
        let fname = outdir.join("bands.dat");
        write_bands_to_txt(&fname, bands, "path index, then one column per band and spin")?;
        info!("Band path written to {:?}", fname);
    }

    if let Some(bands) = output.kpath_bands.as_ref() {
        let fname = outdir.join("bands_kpath.dat");
        write_bands_to_txt(&fname, bands, "kpath index, then one column per band and spin")?;
        info!("Explicit k-path eigenvalues written to {:?}", fname);
    }

    if let Some((ene, dos)) = output.dos.as_ref() {
        let fname = outdir.join("dos.dat");
        write_columns(&fname, &[ene, dos],
            &format!("E  DOS, {:?} smearing, delta = {}", settings.smearing, settings.delta))?;
        info!("DOS written to {:?}", fname);
    }

    if settings.write_h5 {
        let fname = outdir.join("hamiltonian.h5");
        output.to_h5(&fname)?;
        info!("Hamiltonian on the {} grid written to {:?}", output.grid, fname);
    }

    Ok(())
}


#[cfg(test)]
mod test {
    use super::*;
    use std::f64::consts::PI;
    use ndarray as na;
    use tempdir::TempDir;
    use crate::{
        grid::Grid,
        types::c64,
    };

    #[test]
    fn test_run_writes_outputs() {
        let dir = TempDir::new("rspao_run").unwrap();

        let kgrid = Grid::new(2, 2, 1).unwrap();
        let eye = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        let mut kpnts = na::Array2::<f64>::zeros((4, 3));
        let mut u = na::Array4::<c64>::zeros((2, 1, 4, 1));
        let mut eigs = na::Array3::<f64>::zeros((2, 4, 1));
        for ik in 0 .. 4 {
            let (kx, ky) = ((ik / 2) as f64 / 2.0, (ik % 2) as f64 / 2.0);
            kpnts[[ik, 0]] = kx;
            kpnts[[ik, 1]] = ky;
            u[[0, 0, ik, 0]] = c64::new(1.0, 0.0);
            eigs[[0, ik, 0]] = -(2.0 * PI * kx).cos() - (2.0 * PI * ky).cos();
            eigs[[1, ik, 0]] = 5.0;
        }
        let data = DftData {
            kgrid,
            alat: 1.0,
            a_vectors: eye,
            b_vectors: eye,
            kpnts,
            kpnts_wght: na::Array1::from_elem(4, 1.0),
            efermi: 0.0,
            eigs,
            u,
            sks: None,
        };
        let fpath = dir.path().join("dft.h5");
        data.to_h5(&fpath).unwrap();

        let config = dir.path().join("rspao.toml");
        fs::write(&config, format!(r#"
            fpath = {:?}
            outdir = {:?}
            pthr = 0.5
            shift_type = 0
            shift = 0.0
            do_bands = true
            npad = 4
            do_dos = true
            kpath = [[0.25, 0.0, 0.0]]
        "#, fpath, dir.path().join("out"))).unwrap();

        Run { config }.process().unwrap();

        for name in ["projectability.dat", "bands.dat", "bands_kpath.dat", "dos.dat", "hamiltonian.h5"] {
            assert!(dir.path().join("out").join(name).is_file(), "{} is missing", name);
        }
        let bands = fs::read_to_string(dir.path().join("out/bands.dat")).unwrap();
        assert_eq!(bands.lines().count(), 1 + 4 + 4);
    }
}
