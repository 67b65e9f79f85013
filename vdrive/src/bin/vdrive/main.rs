// vim: tw=80
//! Inspect a RAID virtual drive's sparing decisions from the command line.
//!
//! Every subcommand loads a drive description from a YAML file, wires it to
//! the in-memory collaborators, and reports what the virtual drive decides.

use std::{fs, path::PathBuf, process::exit};

use clap::{crate_version, Parser, ValueEnum};
use itertools::Itertools;
use tracing_subscriber::EnvFilter;
use vdrive_core::{
    checkpoint::CopyOutcome,
    config::Tunable,
    mem::InMemory,
    services::*,
    swap::SwapValidation,
    virtual_drive::{DriveDescription, VirtualDrive},
    *
};

/// Never run the monitor more often than this per invocation
const MAX_MONITOR_PASSES: usize = 16;

fn parse_edge(s: &str) -> std::result::Result<EdgeIndex, String> {
    let i = s.parse::<u32>().map_err(|e| e.to_string())?;
    EdgeIndex::try_from(i).map_err(|e| e.to_string())
}

#[derive(Parser, Clone, Debug)]
struct DriveArgs {
    #[clap(required(true))]
    /// YAML description of the virtual drive
    drive:   PathBuf,
    /// Configuration overrides, as comma-separated name=value pairs
    #[clap(short = 'o', long, value_delimiter(','))]
    options: Vec<String>,
}

impl DriveArgs {
    fn open(&self) -> Result<(VirtualDrive, InMemory)> {
        let yaml = fs::read_to_string(&self.drive).unwrap_or_else(|e| {
            eprintln!("Error: cannot read {}: {}", self.drive.display(), e);
            exit(1);
        });
        let desc = DriveDescription::from_yaml(&yaml)?;
        let mem = InMemory::new();
        let mut vd = VirtualDrive::from_description(desc, mem.services())?;
        for opt in self.options.iter() {
            let tunable = Tunable::try_from(opt.as_str()).map_err(|e| {
                eprintln!("Error: invalid option {opt:?}");
                e
            })?;
            vd.config_mut().set(tunable)?;
        }
        mem.journal().nonpaged = vd.np().encode_body();
        Ok((vd, mem))
    }
}

#[derive(Parser, Clone, Debug)]
/// Report downstream health and whether a spare is needed
struct Health {
    #[clap(flatten)]
    drive: DriveArgs,
}

impl Health {
    async fn main(self) -> Result<()> {
        let (vd, _mem) = self.drive.open()?;
        let (proactive, proactive_edge) = vd.check_if_proactive_spare_needed();
        println!("mode:                   {}", vd.mode());
        println!("health:                 {}", vd.downstream_health());
        println!("copy complete:          {}", vd.is_copy_complete());
        println!("permanent spare needed: {}",
                 vd.check_if_permanent_spare_needed());
        println!("proactive spare needed: {}", proactive);
        if let Some(e) = proactive_edge {
            println!("proactive spare edge:   {}", e);
        }
        if let Some(e) = vd.get_swap_out_edge_index()? {
            println!("swap-out edge:          {}", e);
        }
        Ok(())
    }
}

#[derive(Parser, Clone, Debug)]
/// Run the monitor until it settles, and report what it asked for
struct Monitor {
    #[clap(flatten)]
    drive: DriveArgs,
}

impl Monitor {
    async fn main(self) -> Result<()> {
        let (mut vd, mem) = self.drive.open()?;
        mem.set_condition(Condition::EvaluateDownstreamHealth);
        for _ in 0..MAX_MONITOR_PASSES {
            let before = mem.journal().conditions.clone();
            if before.is_empty() {
                break;
            }
            for cond in before.iter().cloned() {
                if cond.is_virtual_drive_condition() {
                    let status = vd.run_condition(cond).await?;
                    println!("run {:?}: {:?}", cond, status);
                } else {
                    println!("raid group {:?}", cond);
                    mem.clear_condition(cond);
                }
            }
            if mem.journal().conditions == before {
                break;
            }
        }
        let journal = mem.journal();
        for req in journal.swap_requests.iter() {
            println!("swap request: {} edge {}", req.command, req.swap_idx);
        }
        for entry in journal.event_log.iter() {
            println!("event log: {:?} orig {} spare {}", entry.code,
                     entry.orig_pvd, entry.spare_pvd);
        }
        Ok(())
    }
}

/// Job service commands, as accepted on the command line
#[derive(Clone, Copy, Debug, ValueEnum)]
enum CommandArg {
    PermanentSpare,
    ProactiveCopy,
    UserCopy,
    UserCopyTo,
    CompleteCopy,
    AbortCopy,
}

impl From<CommandArg> for SwapCommand {
    fn from(c: CommandArg) -> Self {
        match c {
            CommandArg::PermanentSpare => SwapCommand::PermanentSpare,
            CommandArg::ProactiveCopy => SwapCommand::ProactiveCopy,
            CommandArg::UserCopy => SwapCommand::UserCopy,
            CommandArg::UserCopyTo => SwapCommand::UserCopyTo,
            CommandArg::CompleteCopy => SwapCommand::CompleteCopy,
            CommandArg::AbortCopy => SwapCommand::AbortCopy,
        }
    }
}

#[derive(Parser, Clone, Debug)]
/// Validate one swap step on the job service's behalf
struct Validate {
    #[clap(flatten)]
    drive:      DriveArgs,
    #[clap(value_enum)]
    command:    CommandArg,
    /// Edge to swap in or out
    #[clap(value_parser = parse_edge)]
    edge:       EdgeIndex,
    /// Don't ask the virtual drive to confirm each step
    #[clap(long)]
    no_confirm: bool,
}

impl Validate {
    async fn main(self) -> Result<()> {
        let (mut vd, mem) = self.drive.open()?;
        let command = SwapCommand::from(self.command);
        let req = SwapValidation {
            command,
            swap_idx: self.edge,
            confirmation_enabled: !self.no_confirm,
        };
        let r = if command.is_swap_in() {
            vd.validate_swap_in_command(req).await?
        } else {
            vd.validate_swap_out_command(req)
        };
        match r {
            Ok(()) => println!("{} edge {}: allowed", command, self.edge),
            Err(status) => println!("{} edge {}: refused: {}", command,
                                    self.edge, status),
        }
        for code in mem.journal().event_codes() {
            println!("event log: {:?}", code);
        }
        Ok(())
    }
}

#[derive(Parser, Clone, Debug)]
/// List the copy requests that would rebuild the destination edge
struct CopyPlan {
    #[clap(flatten)]
    drive: DriveArgs,
}

impl CopyPlan {
    async fn main(self) -> Result<()> {
        let (vd, _mem) = self.drive.open()?;
        let dest = vd.mode().secondary().ok_or_else(|| {
            eprintln!("Error: {} is not copying", vd.mode());
            Error::InvalidConfigMode
        })?;
        let exported = vd.rg().geometry.logical_capacity();
        let paged_end = vd.rg().geometry.paged_end();
        let start = vd.np().rebuild.checkpoint(dest);
        if start >= paged_end {
            println!("edge {} is fully rebuilt", dest);
            return Ok(());
        }
        let requests = std::iter::successors(Some(start), |&lba| {
            let next = lba + vd.get_copy_block_count(lba);
            (next < paged_end).then_some(next)
        }).map(|lba| (lba, vd.get_copy_block_count(lba)));
        println!("{:<10}{:>10}{:>14}{:>14}", "REGION", "REQUESTS", "START",
                 "END");
        for (user, chunk) in &requests.chunk_by(|&(lba, _)| lba < exported) {
            let chunk = chunk.collect::<Vec<_>>();
            let first = chunk[0].0;
            let (last, blocks) = chunk[chunk.len() - 1];
            let region = if user { "user" } else { "metadata" };
            println!("{:<10}{:>10}{:>#14x}{:>#14x}", region, chunk.len(),
                     first, last + blocks);
        }
        Ok(())
    }
}

/// How the copy ended
#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutcomeArg {
    /// The source was fully copied and swapped out
    Copy,
    /// The destination failed and was swapped out
    DestFailed,
    /// The source failed and was swapped out
    CopyFailed,
}

impl From<OutcomeArg> for CopyOutcome {
    fn from(o: OutcomeArg) -> Self {
        match o {
            OutcomeArg::Copy => CopyOutcome::Complete,
            OutcomeArg::DestFailed => CopyOutcome::DestinationFailed,
            OutcomeArg::CopyFailed => CopyOutcome::Failed,
        }
    }
}

#[derive(Parser, Clone, Debug)]
/// Rewrite the rebuild checkpoints after a copy ends
///
/// The drive must already be back in a pass-thru mode.
struct Complete {
    #[clap(flatten)]
    drive:   DriveArgs,
    #[clap(value_enum)]
    outcome: OutcomeArg,
    /// The swapped-out edge.  Defaults to the one the drive isn't using.
    #[clap(long, value_parser = parse_edge)]
    edge:    Option<EdgeIndex>,
    /// Also write the resulting non-paged metadata here, in binary form
    #[clap(long)]
    dump:    Option<PathBuf>,
}

impl Complete {
    async fn main(self) -> Result<()> {
        let (mut vd, mem) = self.drive.open()?;
        let edge = match self.edge {
            Some(e) => e,
            None => vd.get_swap_out_edge_index()?.ok_or_else(|| {
                eprintln!("Error: no edge has been swapped out");
                Error::InvalidEdgeIndex
            })?
        };
        vd.write_copy_checkpoints(self.outcome.into(), edge).await?;
        let np = mem.journal().persisted()?;
        for (i, slot) in np.rebuild.slots.iter().enumerate() {
            match slot.position {
                Some(e) => println!("checkpoint {}: {:#x} edge {}", i,
                                    slot.checkpoint, e),
                None => println!("checkpoint {}: unused", i),
            }
        }
        println!("rebuild logging: {:#06b}", np.rebuild.rl_bitmask);
        if let Some(path) = self.dump {
            let buf = bincode::serialize(&np)?;
            fs::write(&path, buf).unwrap_or_else(|e| {
                eprintln!("Error: cannot write {}: {}", path.display(), e);
                exit(1);
            });
        }
        Ok(())
    }
}

#[derive(Parser, Clone, Debug)]
enum SubCommand {
    Health(Health),
    Monitor(Monitor),
    Validate(Validate),
    CopyPlan(CopyPlan),
    Complete(Complete),
}

#[derive(Parser, Clone, Debug)]
#[clap(version = crate_version!())]
struct Cli {
    #[clap(subcommand)]
    cmd: SubCommand,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let cli: Cli = Cli::parse();
    match cli.cmd {
        SubCommand::Health(health) => health.main().await,
        SubCommand::Monitor(monitor) => monitor.main().await,
        SubCommand::Validate(validate) => validate.main().await,
        SubCommand::CopyPlan(plan) => plan.main().await,
        SubCommand::Complete(complete) => complete.main().await,
    }
}

// LCOV_EXCL_STOP
