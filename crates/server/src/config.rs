use clap::Parser;

use tether::{DEFAULT_PORT, DEFAULT_TICK_RATE, LinkConditions, PeerConfig, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "tether-server")]
#[command(about = "Headless sync server driving a small demo arena")]
pub struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    pub bind: String,

    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    #[arg(short, long, default_value_t = DEFAULT_TICK_RATE)]
    pub tick_rate: u32,

    #[arg(short, long, default_value_t = 32)]
    pub max_clients: usize,

    #[arg(long, default_value_t = 64_000, help = "Per-client outgoing budget in bytes/sec")]
    pub max_outgoing_rate: u32,

    #[arg(long, help = "Attach an in-process client (listen server)")]
    pub listen: bool,

    #[arg(long, help = "Exit after this many ticks")]
    pub ticks: Option<u64>,

    #[arg(long, default_value_t = 0.0, help = "Outgoing packet loss percentage (0-100)")]
    pub loss_percent: f32,

    #[arg(long, default_value_t = 0.0, help = "Outgoing duplication percentage (0-100)")]
    pub duplicate_percent: f32,

    #[arg(long, default_value_t = 0.0, help = "Outgoing reorder percentage (0-100)")]
    pub reorder_percent: f32,

    #[arg(long, default_value_t = 0, help = "Seed for the packet impairment generator")]
    pub seed: u64,
}

impl Args {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            tick_rate: self.tick_rate,
            max_clients: self.max_clients,
            peer: PeerConfig {
                max_outgoing_rate: self.max_outgoing_rate,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn link_conditions(&self) -> LinkConditions {
        let fraction = |percent: f32| (percent / 100.0).clamp(0.0, 1.0);
        LinkConditions {
            loss: fraction(self.loss_percent),
            duplicate: fraction(self.duplicate_percent),
            reorder: fraction(self.reorder_percent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentages_become_fractions() {
        let args = Args::parse_from(["tether-server", "--loss-percent", "25", "--reorder-percent", "150"]);
        let conditions = args.link_conditions();
        assert_eq!(conditions.loss, 0.25);
        assert_eq!(conditions.duplicate, 0.0);
        assert_eq!(conditions.reorder, 1.0);
    }

    #[test]
    fn arguments_map_onto_the_server_config() {
        let args = Args::parse_from([
            "tether-server",
            "--tick-rate",
            "30",
            "--max-clients",
            "4",
            "--max-outgoing-rate",
            "8000",
        ]);
        let config = args.server_config();
        assert_eq!(config.tick_rate, 30);
        assert_eq!(config.max_clients, 4);
        assert_eq!(config.peer.max_outgoing_rate, 8000);
        assert_eq!(args.bind_addr(), format!("0.0.0.0:{DEFAULT_PORT}"));
        assert!(args.link_conditions().is_perfect());
    }
}
