use std::fs;

/// Identity of the loading process, captured once at startup. PID selector
/// values spelled `"self"` resolve against this at compile time: the host
/// PID normally, the namespace-local PID when the clause is namespaced.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IdentityContext {
    pub pid: u32,
    pub ns_pid: u32,
}

impl IdentityContext {
    pub(crate) fn current() -> IdentityContext {
        let pid = std::process::id();
        IdentityContext {
            pid,
            ns_pid: ns_pid_of(pid).unwrap_or(pid),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test(pid: u32, ns_pid: u32) -> IdentityContext {
        IdentityContext { pid, ns_pid }
    }
}

/// Innermost namespace PID from /proc. The NSpid line lists the PID once
/// per nesting level, outermost first; absent on kernels without pid
/// namespaces, in which case the host PID stands.
fn ns_pid_of(pid: u32) -> Option<u32> {
    let status = fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("NSpid:") {
            return rest.split_whitespace().last()?.parse().ok();
        }
    }
    None
}
