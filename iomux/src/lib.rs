use std::{
    fmt::{self, Display},
    io::{self, stderr, stdout, LineWriter, Write},
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
};

use console::Style;
pub use iomux_core::{
    DrainError, Interrupted, Mux, MuxConfig, Record, TagWriter, TransportKind,
};
use regex::Regex;
use tracing::debug;

/// Which output stream of a child process a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FdTag {
    Stdout,
    Stderr,
}

impl Display for FdTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FdTag::Stdout => f.write_str("stdout"),
            FdTag::Stderr => f.write_str("stderr"),
        }
    }
}

pub trait MuxerHook<T> {
    fn before_record(&mut self, record: &Record<T>);
    fn before_spawn(&mut self, command: &Command);
    fn after_exit(&mut self, _program: &Path, _status: ExitStatus) {}
}

/// A [`Mux`] with hooks and helpers for running child processes.
pub struct Muxer<T> {
    inner: Mux<T>,
    hooks: Vec<Box<dyn MuxerHook<T>>>,
}

impl<T: Clone + PartialEq> Muxer<T> {
    pub fn new() -> Result<Self> {
        Self::with_config(MuxConfig::default())
    }

    pub fn with_config(config: MuxConfig) -> Result<Self> {
        let res = Muxer {
            inner: Mux::with_config(config)?,
            hooks: Vec::new(),
        };
        Ok(res)
    }

    pub fn add_hook<H: MuxerHook<T> + 'static>(&mut self, hook: H) {
        self.hooks.push(Box::new(hook));
    }

    pub fn inner(&self) -> &Mux<T> {
        &self.inner
    }

    pub fn tag(&self, tag: T) -> Result<TagWriter> {
        Ok(self.inner.tag(tag)?)
    }

    pub fn close(&self) -> Result<()> {
        Ok(self.inner.close()?)
    }

    /// Reads one chunk, showing it to every hook first.
    pub fn read(&mut self) -> Result<Record<T>> {
        let record = self.inner.read()?;
        self.notify(&record);
        Ok(record)
    }

    /// Runs [`Mux::read_while`]. Hooks see the collected records once the
    /// drain is over, including the partial ones of a failed drain.
    pub fn read_while<F, E>(&mut self, work: F) -> std::result::Result<Vec<Record<T>>, Interrupted<T, E>>
    where
        F: FnOnce() -> std::result::Result<(), E> + Send,
        E: Send,
    {
        let result = self.inner.read_while(work);
        let records = match &result {
            Ok(records) => records,
            Err(interrupted) => &interrupted.records,
        };
        for record in records {
            self.notify(record);
        }
        result
    }

    /// Spawns `cmd` in its own process group with its stdout and stderr
    /// registered under `out_tag` and `err_tag`.
    pub fn forward(&mut self, mut cmd: Command, out_tag: T, err_tag: T) -> Result<Child> {
        let program = PathBuf::from(cmd.get_program());
        self.attach(&mut cmd, out_tag, err_tag)?;
        cmd.process_group(0);
        self.before_spawn(&cmd);
        let child = cmd
            .spawn()
            .map_err(|source| Error::Spawn { program, source })?;
        debug!(pid = child.id(), "forwarding child output");
        Ok(child)
    }

    /// Runs `cmd` to completion while draining its stdout and stderr.
    ///
    /// Hooks see every chunk as it is read. The command, and with it the
    /// parent's copies of the writers, is dropped as soon as the child exits,
    /// so the drain ends once the child's output is fully read. A grandchild
    /// still holding the streams open keeps the tags registered.
    pub fn capture(&mut self, mut cmd: Command, out_tag: T, err_tag: T) -> Result<Capture<T>> {
        let program = PathBuf::from(cmd.get_program());
        self.attach(&mut cmd, out_tag, err_tag)?;
        self.before_spawn(&cmd);

        let mut status = None;
        let slot = &mut status;
        let mut records = Vec::new();
        let hooks = &mut self.hooks;
        let drained = self.inner.read_while_with(
            move || {
                let outcome = cmd.status();
                drop(cmd);
                *slot = Some(outcome?);
                Ok::<(), io::Error>(())
            },
            |record| {
                for hook in hooks.iter_mut() {
                    hook.before_record(&record);
                }
                records.push(record);
            },
        );

        match drained {
            Ok(()) => {}
            Err(DrainError::Work(source)) => return Err(Error::Spawn { program, source }),
            Err(DrainError::Mux(source)) => {
                return Err(Error::Interrupted {
                    program,
                    records: records.len(),
                    source,
                })
            }
        }
        let Some(status) = status else {
            return Err(Error::MissingStatus { program });
        };
        debug!(program = %program.display(), %status, records = records.len(), "captured child");
        for hook in self.hooks.iter_mut() {
            hook.after_exit(&program, status);
        }
        Ok(Capture { status, records })
    }

    /// Reads until a line written under `tag` matches `re`, and returns that
    /// line.
    ///
    /// Output is split into lines on `\n` before matching, so a line that
    /// arrives over several chunks is matched whole. A final line without a
    /// newline is tried once every endpoint has hung up. Anything `tag` wrote
    /// after the matching line is dropped.
    pub fn wait_for_match(&mut self, tag: &T, re: &Regex) -> Result<Record<T>> {
        let is_match = |line: &[u8]| re.is_match(&String::from_utf8_lossy(line));
        let mut pending = Vec::new();
        loop {
            let record = match self.read() {
                Ok(record) => record,
                Err(Error::Mux(iomux_core::Error::NoConnections))
                    if !pending.is_empty() && is_match(&pending) =>
                {
                    let data = std::mem::take(&mut pending);
                    return Ok(Record { tag: tag.clone(), data });
                }
                Err(e) => return Err(e),
            };
            if record.tag != *tag {
                continue;
            }
            pending.extend_from_slice(&record.data);
            while let Some(end) = pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = pending.drain(..=end).collect();
                if is_match(&line) {
                    return Ok(Record { tag: record.tag, data: line });
                }
            }
        }
    }

    fn attach(&self, cmd: &mut Command, out_tag: T, err_tag: T) -> Result<()> {
        if out_tag == err_tag {
            return Err(Error::Mux(iomux_core::Error::DuplicateTag));
        }
        let stdout = self.inner.tag(out_tag)?;
        let stderr = self.inner.tag(err_tag)?;
        cmd.stdout(Stdio::from(stdout));
        cmd.stderr(Stdio::from(stderr));
        Ok(())
    }

    fn before_spawn(&mut self, cmd: &Command) {
        for hook in self.hooks.iter_mut() {
            hook.before_spawn(cmd);
        }
    }

    fn notify(&mut self, record: &Record<T>) {
        for hook in self.hooks.iter_mut() {
            hook.before_record(record);
        }
    }
}

/// Everything a child wrote, in the order it was read, plus how it exited.
#[derive(Debug)]
pub struct Capture<T> {
    pub status: ExitStatus,
    pub records: Vec<Record<T>>,
}

impl<T: PartialEq> Capture<T> {
    /// All bytes written under `tag`.
    pub fn output(&self, tag: &T) -> Vec<u8> {
        self.records
            .iter()
            .filter(|r| r.tag == *tag)
            .flat_map(|r| r.data.iter().copied())
            .collect()
    }

    pub fn text(&self, tag: &T) -> String {
        String::from_utf8_lossy(&self.output(tag)).into_owned()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Mux(#[from] iomux_core::Error),

    #[error("failed to run {}: {source}", .program.display())]
    Spawn { program: PathBuf, source: io::Error },

    #[error("{} exited without reporting a status", .program.display())]
    MissingStatus { program: PathBuf },

    #[error("draining {} stopped after {records} records: {source}", .program.display())]
    Interrupted {
        program: PathBuf,
        records: usize,
        source: iomux_core::Error,
    },
}

pub type Result<A> = std::result::Result<A, Error>;

pub struct PrintInfo<Stdout: Write, Stderr: Write> {
    pub stdout: Stdout,
    pub stderr: Stderr,
    pub info_style: Style,
    pub stdout_style: Style,
    pub stderr_style: Style,
    label: String,
    // whether the next byte on each stream starts a new line
    stdout_fresh: bool,
    stderr_fresh: bool,
}

impl PrintInfo<LineWriter<io::Stdout>, LineWriter<io::Stderr>> {
    pub fn new() -> Self {
        Self::with_writers(LineWriter::new(stdout()), LineWriter::new(stderr()))
    }
}

impl Default for PrintInfo<LineWriter<io::Stdout>, LineWriter<io::Stderr>> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Stdout: Write, Stderr: Write> PrintInfo<Stdout, Stderr> {
    pub fn with_writers(stdout: Stdout, stderr: Stderr) -> Self {
        Self {
            stdout,
            stderr,
            info_style: Style::new().green(),
            stdout_style: Style::new().white(),
            stderr_style: Style::new().white(),
            label: String::from("iomux"),
            stdout_fresh: true,
            stderr_fresh: true,
        }
    }
}

impl<Stdout: Write, Stderr: Write> MuxerHook<FdTag> for PrintInfo<Stdout, Stderr> {
    fn before_record(&mut self, record: &Record<FdTag>) {
        let (output, forward_style, fresh) = match record.tag {
            FdTag::Stdout => (
                &mut self.stdout as &mut dyn Write,
                &self.stdout_style,
                &mut self.stdout_fresh,
            ),
            FdTag::Stderr => (
                &mut self.stderr as &mut dyn Write,
                &self.stderr_style,
                &mut self.stderr_fresh,
            ),
        };
        let text = record.text();
        for piece in text.split_inclusive('\n') {
            if *fresh {
                let _ = write!(
                    output,
                    "{}{}{} ",
                    self.info_style.apply_to("["),
                    self.info_style.apply_to(&self.label),
                    self.info_style.apply_to("]"),
                );
            }
            let _ = write!(output, "{}", forward_style.apply_to(piece));
            *fresh = piece.ends_with('\n');
        }
    }

    fn before_spawn(&mut self, cmd: &Command) {
        let prog_path: &Path = Path::new(cmd.get_program());
        self.label = prog_path.display().to_string();
        let _ = writeln!(
            &mut self.stdout,
            "{} {}{}",
            self.info_style.apply_to("[Running"),
            self.info_style.apply_to(prog_path.display()),
            self.info_style.apply_to("]")
        );
    }

    fn after_exit(&mut self, program: &Path, status: ExitStatus) {
        for (fresh, output) in [
            (self.stdout_fresh, &mut self.stdout as &mut dyn Write),
            (self.stderr_fresh, &mut self.stderr as &mut dyn Write),
        ] {
            if !fresh {
                let _ = writeln!(output);
            }
            let _ = output.flush();
        }
        self.stdout_fresh = true;
        self.stderr_fresh = true;
        let _ = writeln!(
            &mut self.stdout,
            "{}{} {} {}{}",
            self.info_style.apply_to("["),
            self.info_style.apply_to(program.display()),
            self.info_style.apply_to("terminated with"),
            self.info_style.apply_to(status),
            self.info_style.apply_to("]"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn printer() -> PrintInfo<Vec<u8>, Vec<u8>> {
        console::set_colors_enabled(false);
        PrintInfo::with_writers(Vec::new(), Vec::new())
    }

    fn record(tag: FdTag, data: &str) -> Record<FdTag> {
        Record {
            tag,
            data: data.as_bytes().to_vec(),
        }
    }

    #[test]
    fn prefixes_each_line_once() {
        let mut print = printer();
        print.before_spawn(&Command::new("server"));
        print.before_record(&record(FdTag::Stdout, "one\ntw"));
        print.before_record(&record(FdTag::Stdout, "o\n"));
        print.before_record(&record(FdTag::Stderr, "bad\n"));

        let out = String::from_utf8(print.stdout).unwrap();
        assert_eq!(out, "[Running server]\n[server] one\n[server] two\n");
        assert_eq!(String::from_utf8(print.stderr).unwrap(), "[server] bad\n");
    }

    #[test]
    fn capture_sums_output_per_tag() {
        let capture = Capture {
            status: Command::new("true").status().unwrap(),
            records: vec![
                record(FdTag::Stdout, "a"),
                record(FdTag::Stderr, "x"),
                record(FdTag::Stdout, "b"),
            ],
        };
        assert_eq!(capture.text(&FdTag::Stdout), "ab");
        assert_eq!(capture.output(&FdTag::Stderr), b"x");
    }
}
