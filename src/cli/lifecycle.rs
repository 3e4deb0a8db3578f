//! VM lifecycle commands.

use clap::Args;
use std::path::PathBuf;
use veertu::{action, Error, VmState};

/// Show the VM state.
#[derive(Args, Debug)]
pub struct StatusCmd {}

impl StatusCmd {
    /// Execute the status command.
    pub fn run(self, id: Option<String>) -> veertu::Result<()> {
        let provider = super::provider(id)?;
        let state = provider.state()?;
        println!("{}: {}", provider, state.short);
        println!("{}", state.long);
        Ok(())
    }
}

/// Configure and boot the VM.
#[derive(Args, Debug)]
pub struct UpCmd {
    /// Provider config file (TOML).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Boot with the Veertu window.
    #[arg(long)]
    pub gui: bool,
}

impl UpCmd {
    /// Execute the up command.
    pub fn run(self, id: Option<String>) -> veertu::Result<()> {
        let provider = super::provider(id)?;
        let mut config = super::load_config(self.config.as_deref())?;
        config.gui |= self.gui;

        match provider.state()?.id {
            VmState::NotCreated => return Err(Error::NotCreated),
            VmState::Running => {
                println!("VM is already running");
                return Ok(());
            }
            VmState::Paused | VmState::Suspended => provider.driver().resume()?,
            _ => action::boot(&provider, &config)?,
        }

        println!("Started {}", provider);
        Ok(())
    }
}

/// Shut the VM down.
#[derive(Args, Debug)]
pub struct HaltCmd {}

impl HaltCmd {
    /// Execute the halt command.
    pub fn run(self, id: Option<String>) -> veertu::Result<()> {
        let provider = super::provider(id)?;
        if provider.state()?.id != VmState::Running {
            println!("VM is not running");
            return Ok(());
        }
        provider.driver().halt()?;
        println!("Stopped {}", provider);
        Ok(())
    }
}

/// Pause the VM.
#[derive(Args, Debug)]
pub struct SuspendCmd {}

impl SuspendCmd {
    /// Execute the suspend command.
    pub fn run(self, id: Option<String>) -> veertu::Result<()> {
        let provider = super::provider(id)?;
        let state = provider.state()?.id;
        if state != VmState::Running {
            return Err(Error::InvalidState {
                expected: VmState::Running.to_string(),
                actual: state.to_string(),
            });
        }
        provider.driver().suspend()?;
        println!("Suspended {}", provider);
        Ok(())
    }
}

/// Resume a paused or stopped VM.
#[derive(Args, Debug)]
pub struct ResumeCmd {}

impl ResumeCmd {
    /// Execute the resume command.
    pub fn run(self, id: Option<String>) -> veertu::Result<()> {
        let provider = super::provider(id)?;
        if action::resume(&provider)? {
            println!("Resumed {}", provider);
        } else {
            println!("Nothing to resume");
        }
        Ok(())
    }
}

/// Delete the VM.
#[derive(Args, Debug)]
pub struct DestroyCmd {
    /// Delete without confirmation.
    #[arg(short, long)]
    pub force: bool,
}

impl DestroyCmd {
    /// Execute the destroy command.
    pub fn run(self, id: Option<String>) -> veertu::Result<()> {
        let provider = super::provider(id)?;
        let Some(uuid) = provider.driver().uuid().map(String::from) else {
            println!("VM has not been created");
            return Ok(());
        };

        // Confirm deletion unless --force
        if !self.force {
            eprint!("Delete VM '{}'? [y/N] ", uuid);
            let mut input = String::new();
            if std::io::stdin().read_line(&mut input).is_err()
                || !matches!(input.trim().to_lowercase().as_str(), "y" | "yes")
            {
                println!("Cancelled");
                return Ok(());
            }
        }

        if provider.state()?.id == VmState::Running {
            provider.driver().halt()?;
        }
        provider.driver().delete()?;
        println!("Deleted VM '{}'", uuid);
        Ok(())
    }
}
