//! rtkit-sim - drive an emulated RTKit coprocessor from the host
//!
//! Commands:
//! - `rtkit-sim boot [--config <file>]` - Bring up the coprocessor and show the handshake
//! - `rtkit-sim ping [--config <file>] [--count N]` - Boot, then exchange pings
//! - `rtkit-sim layout --generation v2|v4` - Print the register map

mod config;
mod guest;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::path::PathBuf;

use apple_a7iop::iop::{REG_CPU_CTRL, REG_CPU_STATUS};
use apple_a7iop::{Direction, EventLoop, Generation, Message};
use apple_rtbuddy::{ManagementMessage, RtBuddy, EP_MANAGEMENT, EP_USER_START};

use crate::config::SimConfig;
use crate::guest::{Flow, Guest};

#[derive(Parser)]
#[command(name = "rtkit-sim")]
#[command(version)]
#[command(about = "Drive an emulated RTKit coprocessor through its mailbox registers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring up the coprocessor and print the handshake
    Boot {
        /// Coprocessor description (defaults to the built-in SMC template)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Boot, then exchange keepalive pings
    Ping {
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of pings to send
        #[arg(short = 'n', long, default_value_t = 4)]
        count: u32,
    },

    /// Print the register map of a mailbox generation
    Layout {
        #[arg(short, long, value_enum)]
        generation: GenerationArg,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum GenerationArg {
    V2,
    V4,
}

impl From<GenerationArg> for Generation {
    fn from(arg: GenerationArg) -> Self {
        match arg {
            GenerationArg::V2 => Generation::V2,
            GenerationArg::V4 => Generation::V4,
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Boot { config } => {
            let config = SimConfig::load(config.as_deref())?;
            let mut guest = build(&config)?;
            boot(&mut guest, &config)?;
        }

        Commands::Ping { config, count } => {
            let config = SimConfig::load(config.as_deref())?;
            let mut guest = build(&config)?;
            boot(&mut guest, &config)?;
            ping(&mut guest, count)?;
        }

        Commands::Layout { generation } => {
            show_layout(generation.into());
        }
    }

    Ok(())
}

/// Build the coprocessor described by `config` with echo endpoints
fn build(config: &SimConfig) -> Result<Guest> {
    let event_loop = EventLoop::new();
    let rtb = RtBuddy::new(&config.iop, &event_loop, None)
        .with_context(|| format!("Failed to build coprocessor '{}'", config.iop.role))?;

    for endpoint in &config.endpoints {
        let name = endpoint.name.clone();
        let registered = if endpoint.control {
            rtb.register_control_endpoint(endpoint.id, move |rtb: &RtBuddy, ep, msg| {
                log::info!("{}: control message {:#018x}", name, msg);
                if let Err(e) = rtb.send_control_message(ep, msg) {
                    log::warn!("{}: echo failed: {}", name, e);
                }
            })
        } else {
            rtb.register_user_endpoint(endpoint.id, move |rtb: &RtBuddy, ep, msg| {
                log::info!("{}: user message {:#018x}", name, msg);
                if let Err(e) = rtb.send_user_message(ep, msg) {
                    log::warn!("{}: echo failed: {}", name, e);
                }
            })
        };
        registered.with_context(|| format!("Failed to register endpoint '{}'", endpoint.name))?;
    }

    Ok(Guest::new(rtb, event_loop))
}

fn describe(msg: &Message) -> String {
    if msg.endpoint == EP_MANAGEMENT {
        format!("{:?}", ManagementMessage::decode(msg.msg))
    } else {
        format!("ep {:#x} payload {:#018x}", msg.endpoint, msg.msg)
    }
}

fn print_transcript(transcript: &[(Flow, Message)]) {
    for (flow, msg) in transcript {
        let arrow = match flow {
            Flow::Sent => "AP → IOP".cyan(),
            Flow::Received => "IOP → AP".yellow(),
        };
        println!("  {} {}", arrow, describe(msg));
    }
}

fn boot(guest: &mut Guest, config: &SimConfig) -> Result<()> {
    println!(
        "{} Booting {} ({:?}, RTKit v{})...",
        "🚀".green(),
        config.iop.role.bold(),
        config.iop.generation,
        config.iop.protocol_version
    );

    let report = guest.boot().context("Bring-up failed")?;
    print_transcript(&report.transcript);

    println!("\n{}", "Advertised endpoints:".bold());
    for id in &report.advertised {
        let label = if *id >= EP_USER_START {
            config
                .endpoints
                .iter()
                .find(|ep| !ep.control && ep.id.checked_add(EP_USER_START) == Some(*id))
                .map_or("(unnamed)", |ep| ep.name.as_str())
        } else {
            config
                .endpoints
                .iter()
                .find(|ep| ep.control && ep.id == *id)
                .map_or("(system)", |ep| ep.name.as_str())
        };
        println!("  {:#04x}  {}", id, label);
    }

    println!("\n{} Bring-up complete", "✅".green());
    Ok(())
}

fn ping(guest: &mut Guest, count: u32) -> Result<()> {
    for seg in 0..count {
        let timestamp = (seg as u16).wrapping_mul(0x101);
        guest
            .ping(seg, timestamp)
            .with_context(|| format!("Ping {} failed", seg))?;
    }
    print_transcript(&guest.take_transcript());
    println!("{} {} pings acknowledged", "✅".green(), count);
    Ok(())
}

fn show_layout(generation: Generation) {
    let layout = generation.layout();
    let iop_base = generation.iop_mailbox_base();
    let ap_base = generation.ap_mailbox_base();

    println!("{}", format!("A7IOP {:?} register map", generation).bold().green());
    println!("  {:#06x}  CPU_CTRL", REG_CPU_CTRL);
    let status_access = match generation {
        Generation::V2 => "",
        Generation::V4 => " (read-only)",
    };
    println!("  {:#06x}  CPU_STATUS{}", REG_CPU_STATUS, status_access);

    for (name, base) in [("IOP mailbox", iop_base), ("AP mailbox", ap_base)] {
        println!("\n{} @ {:#06x} (window {:#x})", name.bold(), base, layout.window_size);
        println!("  {:#06x}  INT_MASK_SET", base + layout.int_mask_set);
        println!("  {:#06x}  INT_MASK_CLR", base + layout.int_mask_clr);
        for (dir, label) in [(Direction::Iop, "IOP"), (Direction::Ap, "AP")] {
            println!("  {:#06x}  {}_CTRL", base + layout.ctrl(dir), label);
            for word in 0..layout.slot_words() {
                println!("  {:#06x}  {}_SEND{}", base + layout.send_word(dir, word), label, word);
            }
            for word in 0..layout.slot_words() {
                println!("  {:#06x}  {}_RECV{}", base + layout.recv_word(dir, word), label, word);
            }
        }
    }

    println!(
        "\nMinimum window size: {:#x}",
        generation.required_mmio_size()
    );
}
