use std::path::{
    Path,
    PathBuf,
};

use anyhow::{
    ensure,
    Context,
};
use figment::{
    Figment,
    providers::{
        Format,
        Serialized,
        Toml,
    },
};
use log::warn;
use serde::{
    Serialize,
    Deserialize,
};

use crate::{
    projectability::ShiftType,
    spectrum::Smearing,
    types::Result,
};


/// Run configuration, read from a TOML file on top of the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// HDF5 file holding the projected DFT data.
    pub fpath:          PathBuf,
    /// Treat the PAO basis as non-orthogonal, needs the overlap in the DFT data.
    #[serde(rename = "read_S")]
    pub read_s:         bool,
    pub shift_type:     ShiftType,
    /// Energy shift in eV, relative to the Fermi level.
    pub shift:          f64,
    /// Projectability threshold.
    pub pthr:           f64,
    pub do_comparison:  bool,

    pub double_grid:    bool,
    pub nfft1:          usize,
    pub nfft2:          usize,
    pub nfft3:          usize,

    pub do_bands:       bool,
    pub npad:           usize,
    /// K-points in crystal coordinates evaluated by the explicit Fourier sum.
    pub kpath:          Vec<[f64; 3]>,

    pub do_dos:         bool,
    pub smearing:       Smearing,
    /// Smearing width in eV.
    pub delta:          f64,

    pub nworkers:       usize,
    pub outdir:         PathBuf,
    pub write_h5:       bool,
}


impl Default for Settings {
    fn default() -> Self {
        Self {
            fpath:          PathBuf::from("./dft.h5"),
            read_s:         false,
            shift_type:     ShiftType::Diagonal,
            shift:          20.0,
            pthr:           0.9,
            do_comparison:  false,

            double_grid:    false,
            nfft1:          0,
            nfft2:          0,
            nfft3:          0,

            do_bands:       false,
            npad:           500,
            kpath:          vec![],

            do_dos:         false,
            smearing:       Smearing::Gauss,
            delta:          0.1,

            nworkers:       1,
            outdir:         PathBuf::from("."),
            write_h5:       true,
        }
    }
}


impl Settings {
    pub fn from_file(path: &(impl AsRef<Path> + ?Sized)) -> Result<Self> {
        let path = path.as_ref();
        ensure!(path.is_file(), "Configuration file {:?} not found.", path);

        let settings: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .extract()
            .with_context(|| format!("Invalid configuration in {:?}", path))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::string(s))
            .extract()
            .context("Invalid configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!((0.0 ..= 1.0).contains(&self.pthr),
            "Projectability threshold `pthr` must lie in [0, 1], got {}.", self.pthr);
        ensure!(!self.do_dos || self.delta > 0.0,
            "Smearing width `delta` must be positive, got {}.", self.delta);
        ensure!(self.nworkers > 0, "At least one worker is needed, got `nworkers = 0`.");

        if self.double_grid && self.padding() == [0, 0, 0] {
            warn!("`double_grid` is set but `nfft1`, `nfft2` and `nfft3` are all zero, the grid is kept.");
        }
        if self.do_bands && self.npad == 0 {
            warn!("`npad = 0`, the band path keeps the original sampling.");
        }
        Ok(())
    }

    /// Extra points per axis of the volume interpolation.
    pub fn padding(&self) -> [usize; 3] {
        if self.double_grid {
            [self.nfft1, self.nfft2, self.nfft3]
        } else {
            [0, 0, 0]
        }
    }

    pub fn template() -> Result<String> {
        Ok(toml::to_string_pretty(&Self::default())?)
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use std::fs;
    use tempdir::TempDir;

    #[test]
    fn test_defaults() {
        let s = Settings::from_toml_str("").unwrap();
        assert_eq!(s, Settings::default());
        assert_eq!(s.shift_type, ShiftType::Diagonal);
        assert_eq!(s.padding(), [0, 0, 0]);
    }

    #[test]
    fn test_overrides() {
        let s = Settings::from_toml_str(r#"
            fpath = "/tmp/si.h5"
            read_S = true
            shift_type = 2
            pthr = 0.95
            double_grid = true
            nfft1 = 4
            nfft3 = 2
            do_dos = true
            smearing = "gauss"
            delta = 0.05
            kpath = [[0.0, 0.0, 0.0], [0.5, 0.0, 0.5]]
            nworkers = 4
        "#).unwrap();
        assert!(s.read_s);
        assert_eq!(s.shift_type, ShiftType::Full);
        assert_eq!(s.padding(), [4, 0, 2]);
        assert_eq!(s.kpath.len(), 2);
        assert_eq!(s.kpath[1], [0.5, 0.0, 0.5]);
        assert_eq!(s.fpath, PathBuf::from("/tmp/si.h5"));
        assert_eq!(s.nworkers, 4);
    }

    #[test]
    fn test_rejects() {
        assert!(Settings::from_toml_str("shift_type = 3").is_err());
        assert!(Settings::from_toml_str(r#"smearing = "lorentz""#).is_err());
        assert!(Settings::from_toml_str("pthr = 1.5").is_err());
        assert!(Settings::from_toml_str("nworkers = 0").is_err());
        assert!(Settings::from_toml_str("do_dos = true\ndelta = 0.0").is_err());
        // delta only matters for the DOS
        assert!(Settings::from_toml_str("delta = 0.0").is_ok());
    }

    #[test]
    fn test_template_round_trip() {
        let template = Settings::template().unwrap();
        assert!(template.contains("read_S = false"));

        let dir = TempDir::new("rspao_settings").unwrap();
        let path = dir.path().join("rspao.toml");
        fs::write(&path, &template).unwrap();
        assert_eq!(Settings::from_file(&path).unwrap(), Settings::default());

        assert!(Settings::from_file(&dir.path().join("missing.toml")).is_err());
    }
}
