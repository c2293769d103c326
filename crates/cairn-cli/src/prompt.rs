use std::io::{self, BufRead, IsTerminal, Write};

use zeroize::Zeroizing;

/// Print `message` to stderr and read one line from stdin without echoing
/// it. When stdin is not a terminal the line is read as-is.
pub(crate) fn read_secret(message: &str) -> io::Result<Zeroizing<String>> {
    let mut stderr = io::stderr().lock();
    write!(stderr, "{message}")?;
    stderr.flush()?;

    let stdin = io::stdin();
    let mut line = Zeroizing::new(String::new());
    let read = if stdin.is_terminal() {
        EchoOff::engage(&stdin).and_then(|_guard| stdin.lock().read_line(&mut line))
    } else {
        stdin.lock().read_line(&mut line)
    };
    writeln!(stderr)?;
    if read? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "no passphrase given on stdin",
        ));
    }

    let trimmed = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(trimmed);
    Ok(line)
}

/// Terminal echo is off while this is alive.
#[cfg(unix)]
struct EchoOff {
    fd: std::os::fd::RawFd,
    saved: libc::termios,
}

#[cfg(unix)]
impl EchoOff {
    fn engage(stdin: &io::Stdin) -> io::Result<Self> {
        use std::os::fd::AsRawFd;

        let fd = stdin.as_raw_fd();
        // SAFETY: tcgetattr fully initializes `saved` on success.
        let mut saved: libc::termios = unsafe { std::mem::zeroed() };
        // SAFETY: `fd` is stdin and `saved` is a valid, writable termios.
        if unsafe { libc::tcgetattr(fd, &mut saved) } != 0 {
            return Err(io::Error::last_os_error());
        }

        let mut quiet = saved;
        quiet.c_lflag &= !libc::ECHO;
        // SAFETY: `quiet` is a copy of a termios obtained above.
        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &quiet) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd, saved })
    }
}

#[cfg(unix)]
impl Drop for EchoOff {
    fn drop(&mut self) {
        // SAFETY: restores the attributes read in `engage`.
        unsafe {
            libc::tcsetattr(self.fd, libc::TCSANOW, &self.saved);
        }
    }
}

#[cfg(not(unix))]
struct EchoOff;

#[cfg(not(unix))]
impl EchoOff {
    fn engage(_stdin: &io::Stdin) -> io::Result<Self> {
        Ok(Self)
    }
}
