extern crate crossbeam_channel;
extern crate serde_derive;
extern crate serde_json;

mod config;
mod errors;
mod loader;
mod logs;
mod policy;
pub mod probes;
mod selectors;
mod tracker;
mod utils;

use aya::Bpf;
use clap::Parser;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tracing::{error, info, warn};

use crate::loader::{AyaStore, EbpfLoader};
use crate::policy::{ArgSpec, SelectorSpec, TracingPolicy};
use crate::selectors::matcher::Approvals;
use crate::selectors::reload::{Attachment, ReloadCoordinator};
use crate::tracker::IdentityContext;
use logs::KsLogs;

#[derive(Debug, Parser)]
#[command(name = "kestrel", about = "Selector-driven syscall observation agent")]
struct Opts {
    /// Directory holding config.json5.
    #[arg(long, default_value = "config/")]
    config_dir: String,

    /// Tracing policy file.
    #[arg(long, default_value = "config/policy.json5")]
    policy: String,

    /// Compile the policy and exit without loading anything into the kernel.
    #[arg(long)]
    dry_run: bool,
}

/// One attachment's share of the policy: its display name plus the selector
/// and argument lists the compiler needs.
struct AttachmentSpec {
    name: String,
    selectors: Vec<SelectorSpec>,
    args: Vec<ArgSpec>,
}

fn attachment_specs(policy: &TracingPolicy, features: &config::KsFeatures) -> Vec<AttachmentSpec> {
    let mut specs = Vec::new();
    if features.tracepoints {
        for tp in &policy.tracepoints {
            specs.push(AttachmentSpec {
                name: format!("{}/{}", tp.category, tp.name),
                selectors: tp.selectors.clone(),
                args: tp.args.clone(),
            });
        }
    }
    if features.kprobes {
        for kp in &policy.kprobes {
            specs.push(AttachmentSpec {
                name: format!("kprobe/{}", kp.call),
                selectors: kp.selectors.clone(),
                args: kp.args.clone(),
            });
        }
    }
    specs
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let opts = Opts::parse();
    let conf = config::load_config(&opts.config_dir)?;

    let _logs = KsLogs::new(&conf)?;

    let policy = policy::load_policy(&opts.policy)?;
    let ident = IdentityContext::current();
    let specs = attachment_specs(&policy, &conf.features);
    let attachments: Vec<Attachment> = specs
        .iter()
        .enumerate()
        .map(|(i, s)| Attachment {
            idx: i as u32,
            name: s.name.clone(),
        })
        .collect();

    if opts.dry_run {
        for (att, spec) in attachments.iter().zip(specs.iter()) {
            let blob = selectors::compiler::compile_selectors(
                &att.name,
                &spec.selectors,
                &spec.args,
                &ident,
            )?;
            info!(
                "{}: {} selectors, {} bytes, {} tables",
                att.name,
                spec.selectors.len().max(1),
                blob.bytes().len(),
                blob.tables.len()
            );
        }
        info!("Policy {:?} compiles cleanly", policy.name);
        return Ok(());
    }

    // Bump the memlock rlimit. This is needed for older kernels that don't use the
    // new memcg based accounting, see https://lwn.net/Articles/837122/
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("remove limit on locked memory failed, ret is: {}", ret);
    }

    let mut bpf = Bpf::load_file(&conf.bpf.object_path)?;
    let store = AyaStore::new(&mut bpf)?;
    let coordinator = Arc::new(ReloadCoordinator::new(Box::new(store), attachments.len()));

    for (att, spec) in attachments.iter().zip(specs.iter()) {
        coordinator.publish(att, &spec.selectors, &spec.args, &ident)?;
    }

    let approvals = Arc::new(Mutex::new(Approvals::new()));
    let tracker = tracker::KsProcessTracker::new(&conf.limits, approvals.clone())?;
    let bpf_loader = EbpfLoader::new(tracker);

    let mut probe_list: Vec<Box<dyn probes::Probe>> = Vec::new();
    if conf.features.tracepoints && !policy.tracepoints.is_empty() {
        probe_list.push(Box::new(probes::tracepoints::Tracepoints::new(&policy)));
    }
    if conf.features.kprobes && !policy.kprobes.is_empty() {
        probe_list.push(Box::new(probes::kprobes::Kprobes::new(&policy)));
    }
    bpf_loader.attach(&mut bpf, probe_list)?;

    let mut sighup = unix_signal(SignalKind::hangup())?;
    info!("Policy {:?} live, waiting for SIGHUP or Ctrl-C...", policy.name);

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                reload(&opts.policy, &conf.features, &attachments, &coordinator, &approvals, &ident);
            }
            _ = signal::ctrl_c() => {
                break;
            }
        }
    }

    info!("Exiting...");
    for att in &attachments {
        coordinator.release(att);
    }

    Ok(())
}

/// Re-reads the policy file and republishes every live attachment. A bad
/// policy or a failed publish leaves the previous configuration running;
/// attachments the new file no longer names keep their old selectors, and
/// brand new attachment points need a restart to get a program attached.
fn reload(
    path: &str,
    features: &config::KsFeatures,
    attachments: &[Attachment],
    coordinator: &ReloadCoordinator,
    approvals: &Arc<Mutex<Approvals>>,
    ident: &IdentityContext,
) {
    let policy = match policy::load_policy(path) {
        Ok(p) => p,
        Err(e) => {
            error!(target: "error", "Reload rejected, keeping active policy. Err: {}", e);
            return;
        }
    };
    let specs = attachment_specs(&policy, features);

    let mut changed = false;
    for att in attachments {
        let spec = match specs.iter().find(|s| s.name == att.name) {
            Some(s) => s,
            None => {
                error!(
                    target: "error",
                    "Attachment {} missing from new policy, keeping its old selectors", att.name
                );
                continue;
            }
        };
        match coordinator.publish(att, &spec.selectors, &spec.args, ident) {
            Ok(true) => {
                changed = true;
                info!("Reloaded {}", att.name);
            }
            Ok(false) => (),
            Err(e) => {
                error!(target: "error", "Reload of {} failed, previous selectors stay active. Err: {}", att.name, e);
            }
        }
    }
    for spec in &specs {
        if !attachments.iter().any(|a| a.name == spec.name) {
            warn!("New attachment {} requires a restart to take effect", spec.name);
        }
    }

    if changed {
        approvals.lock().clear();
    }
}
