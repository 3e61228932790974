pub mod kprobes;
pub mod tracepoints;

use aya::Bpf;
use crossbeam_channel::Sender;
use kestrel_common::models::KsEvent;

pub(crate) trait Probe {
    fn init(&self, bpf: &mut Bpf, snd: Sender<KsEvent>) -> Result<(), anyhow::Error>;
}
