use std::{
    fs,
    path::PathBuf,
};

use clap::Args;
use log::info;

use crate::{
    OptProcess,
    settings::Settings,
    types::Result,
};


#[derive(Debug, Args)]
/// Generate a configuration file holding the default value of every option.
pub struct Template {
    #[arg(short, long)]
    /// Write the template to this file instead of the standard output.
    output: Option<PathBuf>,
}


impl OptProcess for Template {
    fn process(&self) -> Result<()> {
        let template = Settings::template()?;
        match self.output.as_ref() {
            Some(path) => {
                fs::write(path, template)?;
                info!("Configuration template written to {:?}", path);
            },
            None => print!("{}", template),
        }
        Ok(())
    }
}
