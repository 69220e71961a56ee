use std::os::unix::io::RawFd;

use libseccomp::{notify_id_valid, ScmpNotifReq, ScmpNotifResp};
use socktap_common::Result;

/// SECCOMP_USER_NOTIF_FLAG_CONTINUE: let the kernel execute the syscall
/// natively instead of substituting a return value.
pub const NOTIF_FLAG_CONTINUE: u32 = 1;

const SECCOMP_ADDFD_FLAG_SETFD: u32 = 1;
const SECCOMP_ADDFD_FLAG_SEND: u32 = 2;

/// struct seccomp_notif_addfd (include/uapi/linux/seccomp.h)
#[repr(C)]
pub struct SeccompNotifAddfd {
    id: u64,
    flags: u32,
    srcfd: u32,
    newfd: u32,
    newfd_flags: u32,
}

// SECCOMP_IOCTL_NOTIF_ADDFD = _IOW('!', 3, struct seccomp_notif_addfd)
nix::ioctl_write_ptr!(seccomp_ioctl_notif_addfd, b'!', 3, SeccompNotifAddfd);

/// Tracer end of the seccomp user-mode notification channel. The
/// supervisor installs the filter in the target and hands us this fd.
pub struct NotifyFd {
    fd: RawFd,
}

impl NotifyFd {
    pub fn new(fd: RawFd) -> NotifyFd {
        NotifyFd { fd }
    }

    pub fn raw(&self) -> RawFd {
        self.fd
    }

    /// Blocking receive of the next notification.
    pub fn recv(&self) -> Result<ScmpNotifReq> {
        Ok(ScmpNotifReq::receive(self.fd)?)
    }

    /// Re-validate a notification id before acting on memory read from the
    /// target. Guards against the syscall having been interrupted (and the
    /// id possibly reused) between the read and the use.
    pub fn id_valid(&self, id: u64) -> bool {
        notify_id_valid(self.fd, id).is_ok()
    }

    pub fn reply_value(&self, id: u64, val: i64) -> Result<()> {
        ScmpNotifResp::new(id, val, 0, 0).respond(self.fd)?;
        Ok(())
    }

    /// Answer with a positive errno; the kernel wants it negated.
    pub fn reply_errno(&self, id: u64, errno: i32) -> Result<()> {
        ScmpNotifResp::new(id, 0, -errno.abs(), 0).respond(self.fd)?;
        Ok(())
    }

    pub fn reply_continue(&self, id: u64) -> Result<()> {
        ScmpNotifResp::new(id, 0, 0, NOTIF_FLAG_CONTINUE).respond(self.fd)?;
        Ok(())
    }

    /// Atomically install `srcfd` into the target's descriptor table and
    /// complete the notification with the new descriptor number as the
    /// syscall return value (SECCOMP_ADDFD_FLAG_SEND). Returns the number
    /// the target sees.
    pub fn install_fd(&self, id: u64, srcfd: RawFd, cloexec: bool) -> nix::Result<i32> {
        let req = SeccompNotifAddfd {
            id,
            flags: SECCOMP_ADDFD_FLAG_SEND,
            srcfd: srcfd as u32,
            newfd: 0,
            newfd_flags: if cloexec { libc::O_CLOEXEC as u32 } else { 0 },
        };
        unsafe { seccomp_ioctl_notif_addfd(self.fd, &req) }
    }

    /// Like [`NotifyFd::install_fd`] but at a caller-chosen descriptor
    /// number, replacing whatever the target had there (dup2/dup3).
    pub fn install_fd_at(
        &self,
        id: u64,
        srcfd: RawFd,
        newfd: i32,
        cloexec: bool,
    ) -> nix::Result<i32> {
        let req = SeccompNotifAddfd {
            id,
            flags: SECCOMP_ADDFD_FLAG_SEND | SECCOMP_ADDFD_FLAG_SETFD,
            srcfd: srcfd as u32,
            newfd: newfd as u32,
            newfd_flags: if cloexec { libc::O_CLOEXEC as u32 } else { 0 },
        };
        unsafe { seccomp_ioctl_notif_addfd(self.fd, &req) }
    }
}

impl Drop for NotifyFd {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.fd);
    }
}
