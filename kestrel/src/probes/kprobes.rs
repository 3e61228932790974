use super::Probe;
use crate::policy::TracingPolicy;
use aya::maps::perf::{AsyncPerfEventArray, PerfBufferError};
use aya::programs::KProbe;
use aya::util::online_cpus;
use aya::Bpf;
use bytes::BytesMut;
use crossbeam_channel::Sender;
use kestrel_common::models::KsEvent;
use std::result::Result;
use tracing::warn;

pub struct Kprobes {
    attach: Vec<String>,
}

impl Kprobes {
    pub fn new(policy: &TracingPolicy) -> Kprobes {
        Kprobes {
            attach: policy.kprobes.iter().map(|kp| kp.call.clone()).collect(),
        }
    }

    #[allow(unreachable_code)]
    fn run(&self, bpf: &mut Bpf, snd: Sender<KsEvent>) -> Result<(), anyhow::Error> {
        let mut kp_array: AsyncPerfEventArray<_> =
            bpf.take_map("KS_KP_EVENTS").unwrap().try_into()?;

        for cpu_id in online_cpus()? {
            let mut kp_buf = kp_array.open(cpu_id, Some(128))?;
            let thread_snd = snd.clone();

            tokio::spawn(async move {
                let mut buffer =
                    vec![BytesMut::with_capacity(core::mem::size_of::<KsEvent>()); 100];

                loop {
                    let events = kp_buf.read_events(&mut buffer).await?;

                    for i in 0..events.read {
                        let buf = &mut buffer[i];
                        let ev: &KsEvent = unsafe { &*(buf.as_ptr() as *const KsEvent) };

                        if let Err(e) = thread_snd.send(ev.clone()) {
                            warn!("Could not send kprobe event. Err: {}", e);
                        }
                    }
                }
                Ok::<_, PerfBufferError>(())
            });
        }
        Ok(())
    }
}

impl Probe for Kprobes {
    fn init(&self, bpf: &mut Bpf, snd: Sender<KsEvent>) -> Result<(), anyhow::Error> {
        self.run(bpf, snd)?;

        let program: &mut KProbe = bpf.program_mut("kestrel_kprobes").unwrap().try_into()?;
        program.load()?;
        for call in &self.attach {
            program.attach(call, 0)?;
        }

        Ok(())
    }
}
