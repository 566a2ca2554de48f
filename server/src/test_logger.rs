use std::sync::{Mutex, Once};

use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;

pub struct LogCapture {
    lines: Mutex<Vec<String>>,
}

impl LogCapture {
    pub fn contains(&self, fragment: &str) -> bool {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .any(|line| line.contains(fragment))
    }

    pub fn clear(&self) {
        self.lines.lock().unwrap().clear();
    }
}

pub static CAPTURE: LogCapture = LogCapture {
    lines: Mutex::new(Vec::new()),
};

static INIT: Once = Once::new();

/// Install a global subscriber that copies every formatted event into
/// [`CAPTURE`]. Tests asserting on output must run serially and `clear()`
/// before acting.
pub fn init() {
    struct Writer;

    impl std::io::Write for Writer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            CAPTURE
                .lines
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(buf).trim().to_string());
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct Factory;

    impl<'a> MakeWriter<'a> for Factory {
        type Writer = Writer;

        fn make_writer(&'a self) -> Self::Writer {
            Writer
        }
    }

    INIT.call_once(|| {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(Factory)
            .with_max_level(LevelFilter::INFO)
            .without_time()
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}
