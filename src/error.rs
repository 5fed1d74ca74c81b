use std::{error, fmt, io};

/// The error type used by this library.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    inner: Option<Box<dyn error::Error + Send + Sync>>,
}

/// List of specific kinds of errors that may occur when using this library.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A USB I/O error was encountered.
    ///
    /// This usually indicates that there is a permission problem, that a driver or another
    /// application is using the device, or that the device was unplugged.
    Usb,

    /// Reading from the data source or writing to the data sink failed.
    Io,

    /// An invalid combination of options was requested.
    ///
    /// These are detected before any device is touched.
    Config,

    /// A firmware image could not be read or decoded.
    Firmware,

    /// Uploading firmware into the controller's RAM failed.
    ///
    /// The firmware state of the device is undefined after this error. Replugging the device
    /// resets it.
    Bootstrap,

    /// A bulk transfer completed with an error or transferred no data.
    Transfer,

    /// A transfer buffer could not be allocated.
    Alloc,

    /// Multiple matching devices were found.
    MultipleDevicesFound,

    /// No matching device was found.
    NoDeviceFound,

    /// Other errors that don't fit the other variants.
    Other,
}

impl Error {
    pub(crate) fn new(
        kind: ErrorKind,
        inner: impl Into<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            kind,
            inner: Some(inner.into()),
        }
    }

    pub(crate) fn usb(inner: rusb::Error) -> Self {
        Self {
            kind: ErrorKind::Usb,
            inner: Some(Box::new(inner)),
        }
    }

    pub(crate) fn io(inner: io::Error) -> Self {
        Self {
            kind: ErrorKind::Io,
            inner: Some(Box::new(inner)),
        }
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, msg.into())
    }

    pub(crate) fn firmware(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Firmware, msg.into())
    }

    pub(crate) fn other(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Other, msg.into())
    }

    pub(crate) fn from_kind(kind: ErrorKind) -> Self {
        Self { kind, inner: None }
    }

    /// Wraps `self` into a new error of kind `kind`, prefixing the message with `context`.
    pub(crate) fn context(self, kind: ErrorKind, context: impl fmt::Display) -> Self {
        let msg = match &self.inner {
            Some(inner) if self.kind == kind => format!("{}: {}", context, inner),
            _ => format!("{}: {}", context, self),
        };
        Self::new(kind, msg)
    }

    /// Returns the `ErrorKind` most closely describing this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self.kind {
            ErrorKind::Usb => "USB error",
            ErrorKind::Io => "I/O error",
            ErrorKind::Config => "invalid configuration",
            ErrorKind::Firmware => "invalid firmware image",
            ErrorKind::Bootstrap => "firmware upload failed",
            ErrorKind::Transfer => "bulk transfer failed",
            ErrorKind::Alloc => "out of memory",
            ErrorKind::MultipleDevicesFound => "multiple matching devices found",
            ErrorKind::NoDeviceFound => "no matching devices found",
            ErrorKind::Other => "other error",
        };

        match &self.inner {
            Some(inner) => write!(f, "{}: {}", msg, inner),
            None => f.write_str(msg),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.inner.as_ref().map(|e| &**e as &dyn error::Error)
    }
}

impl From<rusb::Error> for Error {
    fn from(error: rusb::Error) -> Self {
        Error::usb(error)
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::io(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_inner() {
        let err = Error::config("block size must be even");
        assert_eq!(err.kind(), ErrorKind::Config);
        assert_eq!(
            err.to_string(),
            "invalid configuration: block size must be even"
        );
    }

    #[test]
    fn context_keeps_original_message() {
        let err = Error::usb(rusb::Error::Pipe).context(ErrorKind::Bootstrap, "fw.hex, stage 0");
        assert_eq!(err.kind(), ErrorKind::Bootstrap);
        assert!(err.to_string().starts_with("firmware upload failed: fw.hex, stage 0: USB error"));
    }

    #[test]
    fn bare_kind() {
        assert_eq!(
            Error::from_kind(ErrorKind::NoDeviceFound).to_string(),
            "no matching devices found"
        );
    }
}
