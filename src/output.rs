//! Console output for a deploy run.
//!
//! The run writes every human-facing line through an [`OutputWriter`] handed
//! in by the caller, so the stream and its styling are decided at the call
//! site rather than by process-wide state.

use console::Style;
use std::fmt::Display;
use std::io::Write;

/// Human-readable output sink with optional ANSI styling
#[derive(Debug)]
pub struct OutputWriter<W: Write> {
    out: W,
    color: bool,
}

impl<W: Write> OutputWriter<W> {
    pub fn new(out: W, color: bool) -> Self {
        Self { out, color }
    }

    /// Unstyled output, as used in tests and when piping
    pub fn plain(out: W) -> Self {
        Self::new(out, false)
    }

    pub fn color_enabled(&self) -> bool {
        self.color
    }

    /// Print a line as-is
    pub fn line(&mut self, text: impl Display) {
        self.write_line(&text.to_string());
    }

    /// Section header such as `=== Deployment Output ===`
    pub fn header(&mut self, text: impl Display) {
        let style = Style::new().cyan().bold();
        self.styled(style, text);
    }

    pub fn success(&mut self, text: impl Display) {
        let style = Style::new().green();
        self.styled(style, text);
    }

    pub fn error(&mut self, text: impl Display) {
        let style = Style::new().red();
        self.styled(style, text);
    }

    /// Remote output block, printed verbatim followed by a newline
    pub fn block(&mut self, text: &str) {
        self.write_line(text);
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn styled(&mut self, style: Style, text: impl Display) {
        let rendered = style
            .force_styling(self.color)
            .apply_to(text.to_string())
            .to_string();
        self.write_line(&rendered);
    }

    fn write_line(&mut self, text: &str) {
        let result = writeln!(self.out, "{}", text).and_then(|_| self.out.flush());
        if let Err(e) = result {
            tracing::debug!(error = %e, "failed to write console output");
        }
    }
}

/// Sanitize error messages by collapsing whitespace
pub fn sanitize_error(msg: &str) -> String {
    msg.split_whitespace().collect::<Vec<&str>>().join(" ")
}
