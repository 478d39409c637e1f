use std::fmt::Display;
use std::io::{self, Write};

/// Line-oriented writer for C headers.
pub(super) struct Writer<W: Write> {
    out: W,
}

impl<W: Write> Writer<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// `#define DT_<name> <val>`.
    pub fn dt_define(&mut self, name: &str, val: impl Display) -> io::Result<()> {
        self.define(&format!("DT_{name}"), val, None, None)
    }

    /// Writes a `#define`. With `width`, the macro name is padded to that
    /// many columns. A deprecation message becomes a `__WARN()` annotation.
    pub fn define(
        &mut self,
        name: &str,
        val: impl Display,
        width: Option<usize>,
        deprecation: Option<&str>,
    ) -> io::Result<()> {
        let width = width.unwrap_or(0);
        write!(self.out, "#define {name:<width$}")?;
        if let Some(msg) = deprecation {
            write!(self.out, " __WARN(\"{msg}\")")?;
        }
        writeln!(self.out, " {val}")
    }

    /// Writes a comment, preceded by a blank line. Multi-line text becomes a
    /// `/* ... */` block.
    pub fn comment(&mut self, text: &str) -> io::Result<()> {
        writeln!(self.out)?;
        self.comment_here(text)
    }

    /// Like [`Writer::comment`], without the blank line.
    pub fn comment_here(&mut self, text: &str) -> io::Result<()> {
        if !text.contains('\n') {
            return writeln!(self.out, "/* {text} */");
        }
        writeln!(self.out, "/*")?;
        for line in text.lines() {
            if line.trim().is_empty() {
                writeln!(self.out, " *")?;
            } else {
                writeln!(self.out, " * {line}")?;
            }
        }
        writeln!(self.out, " */")
    }

    pub fn line(&mut self, text: &str) -> io::Result<()> {
        writeln!(self.out, "{text}")
    }

    pub fn finish(mut self) -> io::Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn written(f: impl FnOnce(&mut Writer<Vec<u8>>) -> io::Result<()>) -> String {
        let mut w = Writer::new(Vec::new());
        f(&mut w).unwrap();
        String::from_utf8(w.finish().unwrap()).unwrap()
    }

    #[test]
    fn defines() {
        assert_eq!(
            written(|w| w.dt_define("N_EXISTS", 1)),
            "#define DT_N_EXISTS 1\n"
        );
        assert_eq!(
            written(|w| w.define("DT_A", "DT_N", Some(8), None)),
            "#define DT_A     DT_N\n"
        );
        assert_eq!(
            written(|w| w.define("DT_OLD", 2, None, Some("use DT_NEW"))),
            "#define DT_OLD __WARN(\"use DT_NEW\") 2\n"
        );
    }

    #[test]
    fn comments() {
        assert_eq!(written(|w| w.comment("one line")), "\n/* one line */\n");
        assert_eq!(
            written(|w| w.comment_here("first\n\nsecond\n")),
            "/*\n * first\n *\n * second\n */\n"
        );
    }
}
