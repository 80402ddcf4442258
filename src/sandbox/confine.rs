//! Operating-system confinement for sandbox worker processes.
//!
//! The parent builds the worker command with a scrubbed environment, an empty scratch
//! directory as cwd and tightened resource limits. The worker then drops its own ability to
//! start programs or open sockets before it touches any fragment.

use anyhow::Result;
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::Command;

/// Variables a worker may inherit; everything else, API keys included, is dropped.
const INHERITED_ENV: [&str; 8] = [
    "PATH",
    "LANG",
    "LC_ALL",
    "PYTHONHOME",
    "PYTHONPATH",
    "VIRTUAL_ENV",
    "LD_LIBRARY_PATH",
    "DYLD_LIBRARY_PATH",
];

const MAX_FILE_BYTES: u64 = 64 * 1024 * 1024;
const MAX_OPEN_FILES: u64 = 256;

/// Builds the worker command: only allowlisted variables, cwd and HOME in `scratch`.
pub(crate) fn worker_command<I>(program: &Path, scratch: &Path, parent_env: I) -> Command
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut command = Command::new(program);
    command.env_clear();
    for (key, value) in parent_env {
        if INHERITED_ENV.iter().any(|allowed| OsStr::new(allowed) == key) {
            command.env(key, value);
        }
    }
    command
        .env("HOME", scratch)
        .env("TMPDIR", scratch)
        .env("MPLCONFIGDIR", scratch)
        .env("MPLBACKEND", "Agg")
        .current_dir(scratch);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // SAFETY: the hook only calls async-signal-safe getrlimit/setrlimit.
        unsafe {
            command.pre_exec(apply_resource_limits);
        }
    }

    command
}

#[cfg(unix)]
fn apply_resource_limits() -> std::io::Result<()> {
    let limits = [
        (libc::RLIMIT_CORE, 0),
        (libc::RLIMIT_FSIZE, MAX_FILE_BYTES),
        (libc::RLIMIT_NOFILE, MAX_OPEN_FILES),
    ];
    for (resource, ceiling) in limits {
        let mut current = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if unsafe { libc::getrlimit(resource, &mut current) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        let ceiling = ceiling as libc::rlim_t;
        let lowered = libc::rlimit {
            rlim_cur: current.rlim_cur.min(ceiling),
            rlim_max: current.rlim_max.min(ceiling),
        };
        if unsafe { libc::setrlimit(resource, &lowered) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
mod seccomp {
    use anyhow::{Result, bail};

    // Classic BPF opcodes and seccomp return values from the kernel UAPI headers.
    const BPF_LD_W_ABS: u16 = 0x20;
    const BPF_JMP_JEQ_K: u16 = 0x15;
    const BPF_RET_K: u16 = 0x06;
    const SECCOMP_MODE_FILTER: libc::c_ulong = 2;
    const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
    const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
    const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
    const SECCOMP_DATA_NR: u32 = 0;
    const SECCOMP_DATA_ARCH: u32 = 4;

    #[cfg(target_arch = "x86_64")]
    const AUDIT_ARCH: u32 = 0xC000_003E;
    #[cfg(target_arch = "aarch64")]
    const AUDIT_ARCH: u32 = 0xC000_00B7;

    const DENIED_SYSCALLS: [libc::c_long; 3] =
        [libc::SYS_execve, libc::SYS_execveat, libc::SYS_socket];

    fn statement(code: u16, k: u32) -> libc::sock_filter {
        libc::sock_filter {
            code,
            jt: 0,
            jf: 0,
            k,
        }
    }

    fn jump_if_equal(k: u32, jt: u8) -> libc::sock_filter {
        libc::sock_filter {
            code: BPF_JMP_JEQ_K,
            jt,
            jf: 0,
            k,
        }
    }

    fn program() -> Vec<libc::sock_filter> {
        let mut filter = vec![
            statement(BPF_LD_W_ABS, SECCOMP_DATA_ARCH),
            jump_if_equal(AUDIT_ARCH, 1),
            statement(BPF_RET_K, SECCOMP_RET_KILL_PROCESS),
            statement(BPF_LD_W_ABS, SECCOMP_DATA_NR),
        ];
        let denied = DENIED_SYSCALLS.len();
        for (index, syscall) in DENIED_SYSCALLS.iter().enumerate() {
            // Jumps over the remaining checks and the allow to the final deny.
            filter.push(jump_if_equal(*syscall as u32, (denied - index) as u8));
        }
        filter.push(statement(BPF_RET_K, SECCOMP_RET_ALLOW));
        filter.push(statement(
            BPF_RET_K,
            SECCOMP_RET_ERRNO | libc::EPERM as u32,
        ));
        filter
    }

    pub(super) fn install() -> Result<()> {
        let mut filter = program();
        let fprog = libc::sock_fprog {
            len: filter.len() as libc::c_ushort,
            filter: filter.as_mut_ptr(),
        };

        let no_new_privs = unsafe {
            libc::prctl(
                libc::PR_SET_NO_NEW_PRIVS,
                1 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
            )
        };
        if no_new_privs != 0 {
            bail!(
                "Failed to confine sandbox worker: no_new_privs: {}",
                std::io::Error::last_os_error()
            );
        }
        let installed = unsafe {
            libc::prctl(
                libc::PR_SET_SECCOMP,
                SECCOMP_MODE_FILTER,
                &fprog as *const libc::sock_fprog,
            )
        };
        if installed != 0 {
            bail!(
                "Failed to confine sandbox worker: seccomp filter: {}",
                std::io::Error::last_os_error()
            );
        }
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::{DENIED_SYSCALLS, SECCOMP_RET_ALLOW, program};

        #[test]
        fn every_denied_syscall_jumps_to_the_deny_return() {
            let filter = program();
            let deny_index = filter.len() - 1;
            assert_eq!(filter[deny_index - 1].k, SECCOMP_RET_ALLOW);

            for (offset, syscall) in DENIED_SYSCALLS.iter().enumerate() {
                let index = 4 + offset;
                assert_eq!(filter[index].k, *syscall as u32);
                assert_eq!(index + 1 + filter[index].jt as usize, deny_index);
            }
        }
    }
}

/// Stops the calling process from executing programs or opening sockets.
///
/// Only the worker calls this, right after it starts and before any fragment runs.
pub(crate) fn restrict_syscalls() -> Result<()> {
    #[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
    seccomp::install()?;
    Ok(())
}
