use super::Probe;
use crate::policy::TracingPolicy;
use aya::maps::perf::{AsyncPerfEventArray, PerfBufferError};
use aya::programs::TracePoint;
use aya::util::online_cpus;
use aya::Bpf;
use bytes::BytesMut;
use crossbeam_channel::Sender;
use kestrel_common::models::KsEvent;
use std::result::Result;
use tracing::warn;

pub struct Tracepoints {
    attach: Vec<(String, String)>,
}

impl Tracepoints {
    pub fn new(policy: &TracingPolicy) -> Tracepoints {
        Tracepoints {
            attach: policy
                .tracepoints
                .iter()
                .map(|tp| (tp.category.clone(), tp.name.clone()))
                .collect(),
        }
    }

    #[allow(unreachable_code)]
    fn run(&self, bpf: &mut Bpf, snd: Sender<KsEvent>) -> Result<(), anyhow::Error> {
        let mut tp_array: AsyncPerfEventArray<_> =
            bpf.take_map("KS_TP_EVENTS").unwrap().try_into()?;

        for cpu_id in online_cpus()? {
            let mut tp_buf = tp_array.open(cpu_id, Some(128))?;
            let thread_snd = snd.clone();

            tokio::spawn(async move {
                let mut buffer =
                    vec![BytesMut::with_capacity(core::mem::size_of::<KsEvent>()); 100];

                loop {
                    let events = tp_buf.read_events(&mut buffer).await?;

                    for i in 0..events.read {
                        let buf = &mut buffer[i];
                        let ev: &KsEvent = unsafe { &*(buf.as_ptr() as *const KsEvent) };

                        if let Err(e) = thread_snd.send(ev.clone()) {
                            warn!("Could not send tracepoint event. Err: {}", e);
                        }
                    }
                }
                Ok::<_, PerfBufferError>(())
            });
        }
        Ok(())
    }
}

impl Probe for Tracepoints {
    fn init(&self, bpf: &mut Bpf, snd: Sender<KsEvent>) -> Result<(), anyhow::Error> {
        self.run(bpf, snd)?;

        let program: &mut TracePoint = bpf.program_mut("kestrel_tracepoints").unwrap().try_into()?;
        program.load()?;
        for (category, name) in &self.attach {
            program.attach(category, name)?;
        }

        Ok(())
    }
}
