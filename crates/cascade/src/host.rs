/// Output sink for programs running on the engine.
pub trait Host {
    fn write_line(&mut self, line: &str);
}

/// Writes every line to the process's stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutHost;

impl Host for StdoutHost {
    fn write_line(&mut self, line: &str) {
        println!("{}", line);
    }
}

/// Keeps every line in memory; used by tests and the fixture runner.
#[derive(Debug, Default, Clone)]
pub struct CaptureHost {
    lines: Vec<String>,
}

impl CaptureHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }
}

impl Host for CaptureHost {
    fn write_line(&mut self, line: &str) {
        self.lines.push(line.to_string());
    }
}

impl<H: Host + ?Sized> Host for &mut H {
    fn write_line(&mut self, line: &str) {
        (**self).write_line(line)
    }
}
