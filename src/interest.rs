use std::fmt;
use std::ops::{BitOr, BitOrAssign, BitAnd, Sub, Not};

/// The set of epoll-visible conditions a `Channel` can register interest in
/// or report back after a `Poller::wait()` round.
///
/// Mirrors the four bits the original C++ reactor's `Channel` ever looks
/// at: `kReadEvent` (`EPOLLIN|EPOLLPRI`), `kWriteEvent` (`EPOLLOUT`), plus
/// error and hangup, which are always implicitly watched.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Interest(u8);

const READABLE: u8 = 0b0001;
const WRITABLE: u8 = 0b0010;
const ERROR: u8 = 0b0100;
const HUP: u8 = 0b1000;

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(READABLE);
    pub const WRITABLE: Interest = Interest(WRITABLE);
    pub const ERROR: Interest = Interest(ERROR);
    pub const HUP: Interest = Interest(HUP);

    pub fn is_readable(&self) -> bool {
        self.0 & READABLE != 0
    }

    pub fn is_writable(&self) -> bool {
        self.0 & WRITABLE != 0
    }

    pub fn is_error(&self) -> bool {
        self.0 & ERROR != 0
    }

    pub fn is_hup(&self) -> bool {
        self.0 & HUP != 0
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Interest {
    type Output = Interest;
    fn bitor(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, other: Interest) {
        self.0 |= other.0;
    }
}

impl BitAnd for Interest {
    type Output = Interest;
    fn bitand(self, other: Interest) -> Interest {
        Interest(self.0 & other.0)
    }
}

impl Sub for Interest {
    type Output = Interest;
    fn sub(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }
}

impl Not for Interest {
    type Output = Interest;
    fn not(self) -> Interest {
        Interest(!self.0 & (READABLE | WRITABLE | ERROR | HUP))
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.is_readable() {
            parts.push("READABLE");
        }
        if self.is_writable() {
            parts.push("WRITABLE");
        }
        if self.is_error() {
            parts.push("ERROR");
        }
        if self.is_hup() {
            parts.push("HUP");
        }
        if parts.is_empty() {
            parts.push("NONE");
        }
        write!(f, "{}", parts.join(" | "))
    }
}

#[cfg(test)]
mod tests {
    use super::Interest;

    #[test]
    fn combine_and_query() {
        let i = Interest::READABLE | Interest::WRITABLE;
        assert!(i.is_readable());
        assert!(i.is_writable());
        assert!(!i.is_error());
    }

    #[test]
    fn subtract_removes_bit() {
        let i = (Interest::READABLE | Interest::WRITABLE) - Interest::WRITABLE;
        assert!(i.is_readable());
        assert!(!i.is_writable());
    }

    #[test]
    fn none_is_falsy_everywhere() {
        assert!(Interest::NONE.is_none());
        assert!(!Interest::NONE.is_readable());
    }
}
