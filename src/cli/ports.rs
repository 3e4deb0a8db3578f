//! Port forwarding and SSH commands.

use clap::Args;
use veertu::{Error, ForwardedPort};

/// Parse a port mapping specification (HOST:GUEST or PORT).
pub fn parse_port(s: &str) -> Result<(u16, u16), String> {
    if let Some((host, guest)) = s.split_once(':') {
        let host: u16 = host
            .parse()
            .map_err(|_| format!("invalid host port: {}", host))?;
        let guest: u16 = guest
            .parse()
            .map_err(|_| format!("invalid guest port: {}", guest))?;
        Ok((host, guest))
    } else {
        let port: u16 = s.parse().map_err(|_| format!("invalid port: {}", s))?;
        Ok((port, port))
    }
}

/// List forwarded ports.
#[derive(Args, Debug)]
pub struct PortsCmd {
    /// Only show rules when the VM is running.
    #[arg(long)]
    pub active: bool,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

impl PortsCmd {
    /// Execute the ports command.
    pub fn run(self, id: Option<String>) -> veertu::Result<()> {
        let provider = super::provider(id)?;
        let rules = provider.driver().read_forwarded_ports(None, self.active)?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&rules)?);
            return Ok(());
        }

        if rules.is_empty() {
            println!("No forwarded ports");
            return Ok(());
        }

        println!(
            "{:<16} {:<6} {:<16} {:<6} {:<6}",
            "NAME", "PROTO", "HOST", "HOST", "GUEST"
        );
        for rule in rules {
            println!(
                "{:<16} {:<6} {:<16} {:<6} {:<6}",
                rule.name, rule.protocol, rule.host_ip, rule.host_port, rule.guest_port
            );
        }
        Ok(())
    }
}

/// Forward a host port to the guest.
#[derive(Args, Debug)]
pub struct ForwardCmd {
    /// Rule name.
    pub name: String,

    /// Port mapping (HOST:GUEST or PORT).
    #[arg(value_parser = parse_port, value_name = "HOST:GUEST")]
    pub port: (u16, u16),

    /// Transport protocol.
    #[arg(long, default_value = "tcp", value_parser = ["tcp", "udp"])]
    pub protocol: String,

    /// Host address to bind.
    #[arg(long, default_value = "127.0.0.1")]
    pub host_ip: String,

    /// Guest address to forward to.
    #[arg(long, default_value = "")]
    pub guest_ip: String,
}

impl ForwardCmd {
    /// Execute the forward command.
    pub fn run(self, id: Option<String>) -> veertu::Result<()> {
        let provider = super::provider(id)?;
        let (host, guest) = self.port;

        let used = provider.driver().read_used_ports()?;
        if used.contains(&host) {
            return Err(Error::Config(format!(
                "host port {} is already used by another VM",
                host
            )));
        }

        let rule = ForwardedPort::new(self.name, host, guest)
            .protocol(self.protocol)
            .host_ip(self.host_ip)
            .guest_ip(self.guest_ip);
        provider.driver().forward_ports(std::slice::from_ref(&rule))?;
        println!("Forwarding {}:{} -> {}", rule.host_ip, host, guest);
        Ok(())
    }
}

/// Remove all forwarded ports.
#[derive(Args, Debug)]
pub struct ClearPortsCmd {}

impl ClearPortsCmd {
    /// Execute the clear-ports command.
    pub fn run(self, id: Option<String>) -> veertu::Result<()> {
        let provider = super::provider(id)?;
        provider.driver().clear_forwarded_ports()?;
        println!("Cleared forwarded ports");
        Ok(())
    }
}

/// Show the SSH endpoint.
#[derive(Args, Debug)]
pub struct SshInfoCmd {
    /// Guest port SSH listens on.
    #[arg(long, default_value_t = veertu::provider::DEFAULT_SSH_GUEST_PORT)]
    pub guest_port: u16,
}

impl SshInfoCmd {
    /// Execute the ssh-info command.
    pub fn run(self, id: Option<String>) -> veertu::Result<()> {
        let mut provider = super::provider(id)?;
        provider.set_ssh_guest_port(self.guest_port);

        match provider.ssh_info()? {
            Some(info) => println!("{}:{}", info.host, info.port),
            None => println!("SSH is not available"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_pair() {
        assert_eq!(parse_port("2222:22").unwrap(), (2222, 22));
        assert_eq!(parse_port("8080").unwrap(), (8080, 8080));
    }

    #[test]
    fn test_parse_port_rejects_garbage() {
        assert!(parse_port("ssh:22").is_err());
        assert!(parse_port("2222:").is_err());
        assert!(parse_port("70000").is_err());
    }
}
