//! Box import and export commands.

use clap::Args;
use std::path::PathBuf;
use veertu::{action, Error, VmState};

/// Import a box as a new VM.
#[derive(Args, Debug)]
pub struct ImportCmd {
    /// Box file to import.
    pub source: PathBuf,

    /// Provider config file (TOML).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Boot the VM after importing.
    #[arg(long)]
    pub up: bool,
}

impl ImportCmd {
    /// Execute the import command.
    pub fn run(self, id: Option<String>) -> veertu::Result<()> {
        if !self.source.exists() {
            return Err(Error::Config(format!(
                "box not found: {}",
                self.source.display()
            )));
        }

        let mut provider = super::provider(id)?;
        let state = provider.state()?.id;
        if state != VmState::NotCreated {
            return Err(Error::InvalidState {
                expected: VmState::NotCreated.to_string(),
                actual: state.to_string(),
            });
        }

        let config = super::load_config(self.config.as_deref())?;
        let id = action::import(&mut provider, &config, &self.source, super::print_progress)?;
        println!();
        println!("Imported VM '{}'", id);

        if self.up {
            action::boot(&provider, &config)?;
            println!("Started {}", provider);
        }
        Ok(())
    }
}

/// Export the VM as a box.
#[derive(Args, Debug)]
pub struct ExportCmd {
    /// Directory to write the box into.
    #[arg(default_value = ".")]
    pub dir: PathBuf,
}

impl ExportCmd {
    /// Execute the export command.
    pub fn run(self, id: Option<String>) -> veertu::Result<()> {
        let provider = super::provider(id)?;
        std::fs::create_dir_all(&self.dir)?;

        let path = action::export(&provider, &self.dir, super::print_progress)?;
        println!();
        println!("Exported to {}", path.display());
        Ok(())
    }
}
