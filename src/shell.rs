//! Interactive command shell over a mounted volume.
//!
//! Commands are looked up by name in a dispatch table; each one receives the
//! whitespace-split argument list with the command name at index 0.

use std::{
    collections::HashMap,
    io::{self, BufRead, Write},
};

use log::debug;
use onlyerror::Error;

use crate::{
    block_dev::BlockDevice,
    common::{AlphaError, EntryKind, Permission},
    fs::AlphaFs,
    path::{self, absolute},
    ROOT_NAME,
};

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("{0}")]
    Fs(AlphaError),
    #[error("{0}")]
    Io(io::Error),
    #[error("{0}")]
    Usage(&'static str),
    #[error("{0}")]
    Json(String),
}

impl From<AlphaError> for ShellError {
    fn from(e: AlphaError) -> Self {
        ShellError::Fs(e)
    }
}

impl From<io::Error> for ShellError {
    fn from(e: io::Error) -> Self {
        ShellError::Io(e)
    }
}

impl From<serde_json::Error> for ShellError {
    fn from(e: serde_json::Error) -> Self {
        ShellError::Json(e.to_string())
    }
}

pub type ShellResult<T> = Result<T, ShellError>;

type Command<D> =
    fn(&mut Shell<D>, &[&str], &mut dyn BufRead, &mut dyn Write) -> ShellResult<()>;

const HELP: &[(&str, &str)] = &[
    ("quit", "Leaves the terminal."),
    ("ls [DIRECTORY]", "Lists the entries of a directory, the current one by default."),
    ("mkdir DIRECTORY", "Creates a directory."),
    ("cd DIRECTORY", "Changes directories. '..' goes up one level."),
    ("pwd", "Prints the current directory."),
    ("rm PATH", "Removes a file, or a directory with everything in it."),
    ("cp SOURCE DEST", "Copies a file or directory tree."),
    ("mv SOURCE DEST", "Moves a file or directory tree."),
    ("stat [--json] PATH", "Displays entry metadata."),
    ("touch FILE", "Creates an empty file unless it exists."),
    ("cat FILE", "Prints the content of a file or link."),
    ("ln TARGET LINK", "Creates a link holding the path of TARGET."),
    ("chmod read|write|execute PATH", "Sets the permission level of an entry."),
    ("linuxtoalpha HOSTFILE ALPHAFILE", "Copies a host file onto the volume."),
    ("alphatolinux ALPHAFILE HOSTFILE", "Copies a file from the volume to the host."),
    ("textedit FILE", "Replaces the content of a file with one typed line, creating it if needed."),
    ("df [--json]", "Shows block usage of the volume."),
    ("fsck", "Checks the volume for lost, leaked or doubly used blocks."),
    ("defrag", "Merges adjacent free runs."),
    ("help", "Shows this list."),
];

pub struct Shell<D: BlockDevice> {
    fs: AlphaFs<D>,
    cwd: String,
    running: bool,
    commands: HashMap<&'static str, Command<D>>,
}

impl<D: BlockDevice> Shell<D> {
    pub fn new(fs: AlphaFs<D>) -> Self {
        let mut commands: HashMap<&'static str, Command<D>> = HashMap::new();
        commands.insert("ls", ls);
        commands.insert("mkdir", mkdir);
        commands.insert("cd", cd);
        commands.insert("pwd", pwd);
        commands.insert("rm", rm);
        commands.insert("cp", cp);
        commands.insert("mv", mv);
        commands.insert("stat", stat);
        commands.insert("touch", touch);
        commands.insert("cat", cat);
        commands.insert("ln", ln);
        commands.insert("chmod", chmod);
        commands.insert("linuxtoalpha", linuxtoalpha);
        commands.insert("alphatolinux", alphatolinux);
        commands.insert("textedit", textedit);
        commands.insert("df", df);
        commands.insert("fsck", fsck);
        commands.insert("defrag", defrag);
        commands.insert("quit", quit);
        commands.insert("help", help);
        Self {
            fs,
            cwd: format!("/{}", ROOT_NAME),
            running: true,
            commands,
        }
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn fs(&self) -> &AlphaFs<D> {
        &self.fs
    }

    pub fn into_fs(self) -> AlphaFs<D> {
        self.fs
    }

    pub fn prompt(&self) -> String {
        format!("{}> ", self.cwd)
    }

    fn absolute(&self, arg: &str) -> ShellResult<String> {
        Ok(absolute(&self.cwd, arg)?)
    }

    /// Runs one input line. Command failures are reported on `out`; only a
    /// failure to write to `out` is returned.
    pub fn execute(
        &mut self,
        line: &str,
        input: &mut dyn BufRead,
        out: &mut dyn Write,
    ) -> io::Result<()> {
        let args: Vec<&str> = line.split_whitespace().collect();
        let Some(&name) = args.first() else {
            return Ok(());
        };
        let Some(command) = self.commands.get(name).copied() else {
            return writeln!(out, "Command '{}' doesn't exist", name);
        };
        debug!("running {:?}", args);
        match command(self, &args, input, out) {
            Ok(()) => Ok(()),
            Err(ShellError::Io(e)) if e.kind() == io::ErrorKind::BrokenPipe => Err(e),
            Err(e) => writeln!(out, "{}", e),
        }
    }

    /// Prompt loop until `quit` or end of input.
    pub fn run(&mut self, input: &mut dyn BufRead, out: &mut dyn Write) -> io::Result<()> {
        let mut line = String::new();
        while self.running {
            write!(out, "{}", self.prompt())?;
            out.flush()?;
            line.clear();
            if input.read_line(&mut line)? == 0 {
                writeln!(out)?;
                break;
            }
            self.execute(&line, input, out)?;
        }
        Ok(())
    }
}

fn arg<'a>(args: &[&'a str], index: usize, usage: &'static str) -> ShellResult<&'a str> {
    args.get(index).copied().ok_or(ShellError::Usage(usage))
}

fn ls<D: BlockDevice>(
    shell: &mut Shell<D>,
    args: &[&str],
    _: &mut dyn BufRead,
    out: &mut dyn Write,
) -> ShellResult<()> {
    let dir = match args.get(1) {
        Some(arg) => shell.absolute(arg)?,
        None => shell.cwd.clone(),
    };
    let loc = shell.fs.resolve(&dir)?;
    for name in shell.fs.list_children(loc)? {
        writeln!(out, "{}", name)?;
    }
    Ok(())
}

fn mkdir<D: BlockDevice>(
    shell: &mut Shell<D>,
    args: &[&str],
    _: &mut dyn BufRead,
    _: &mut dyn Write,
) -> ShellResult<()> {
    let dir = shell.absolute(arg(args, 1, "usage: mkdir DIRECTORY")?)?;
    shell.fs.make_directory(&dir)?;
    Ok(())
}

fn cd<D: BlockDevice>(
    shell: &mut Shell<D>,
    args: &[&str],
    _: &mut dyn BufRead,
    _: &mut dyn Write,
) -> ShellResult<()> {
    let dir = shell.absolute(arg(args, 1, "Not a valid directory")?)?;
    let loc = shell
        .fs
        .lookup(&dir)?
        .ok_or(ShellError::Usage("No such file or directory"))?;
    if shell.fs.stat(loc)?.kind != EntryKind::Directory {
        return Err(ShellError::Usage("Cannot cd to a file. Only directories."));
    }
    shell.cwd = dir;
    Ok(())
}

fn pwd<D: BlockDevice>(
    shell: &mut Shell<D>,
    _: &[&str],
    _: &mut dyn BufRead,
    out: &mut dyn Write,
) -> ShellResult<()> {
    writeln!(out, "{}", shell.cwd)?;
    Ok(())
}

fn rm<D: BlockDevice>(
    shell: &mut Shell<D>,
    args: &[&str],
    _: &mut dyn BufRead,
    _: &mut dyn Write,
) -> ShellResult<()> {
    let target = shell.absolute(arg(args, 1, "usage: rm PATH")?)?;
    if path::is_within(&shell.cwd, &target)? {
        return Err(ShellError::Usage("cannot remove the current directory or one above it"));
    }
    shell.fs.delete_path(&target)?;
    Ok(())
}

fn cp<D: BlockDevice>(
    shell: &mut Shell<D>,
    args: &[&str],
    _: &mut dyn BufRead,
    _: &mut dyn Write,
) -> ShellResult<()> {
    let from = shell.absolute(arg(args, 1, "usage: cp SOURCE DEST")?)?;
    let to = shell.absolute(arg(args, 2, "usage: cp SOURCE DEST")?)?;
    shell.fs.copy_path(&from, &to)?;
    Ok(())
}

fn mv<D: BlockDevice>(
    shell: &mut Shell<D>,
    args: &[&str],
    _: &mut dyn BufRead,
    _: &mut dyn Write,
) -> ShellResult<()> {
    let from = shell.absolute(arg(args, 1, "usage: mv SOURCE DEST")?)?;
    let to = shell.absolute(arg(args, 2, "usage: mv SOURCE DEST")?)?;
    if path::is_within(&shell.cwd, &from)? {
        return Err(ShellError::Usage("cannot move the current directory or one above it"));
    }
    shell.fs.move_path(&from, &to)?;
    Ok(())
}

fn stat<D: BlockDevice>(
    shell: &mut Shell<D>,
    args: &[&str],
    _: &mut dyn BufRead,
    out: &mut dyn Write,
) -> ShellResult<()> {
    let (json, target) = match args.get(1) {
        Some(&"--json") => (true, arg(args, 2, "usage: stat [--json] PATH")?),
        _ => (false, arg(args, 1, "usage: stat [--json] PATH")?),
    };
    let loc = shell.fs.resolve(&shell.absolute(target)?)?;
    let meta = shell.fs.stat(loc)?;
    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&meta)?)?;
        return Ok(());
    }
    writeln!(out, "Identifier Type: {}", meta.kind)?;
    writeln!(out, "File Name: {}", meta.name)?;
    writeln!(out, "Permissions: {}", meta.permission)?;
    writeln!(out, "Modified: {}", meta.modified)?;
    writeln!(out, "Created: {}", meta.created)?;
    writeln!(out, "File Size: {}", meta.size)?;
    Ok(())
}

fn touch<D: BlockDevice>(
    shell: &mut Shell<D>,
    args: &[&str],
    _: &mut dyn BufRead,
    _: &mut dyn Write,
) -> ShellResult<()> {
    let file = shell.absolute(arg(args, 1, "usage: touch FILE")?)?;
    match shell.fs.lookup(&file)? {
        Some(loc) => shell.fs.set_modified_at(loc)?,
        None => {
            shell.fs.make_file(&file)?;
        }
    }
    Ok(())
}

fn cat<D: BlockDevice>(
    shell: &mut Shell<D>,
    args: &[&str],
    _: &mut dyn BufRead,
    out: &mut dyn Write,
) -> ShellResult<()> {
    let file = shell.absolute(arg(args, 1, "usage: cat FILE")?)?;
    let data = shell.fs.read_path(&file)?;
    writeln!(out, "{}", String::from_utf8_lossy(&data))?;
    Ok(())
}

fn ln<D: BlockDevice>(
    shell: &mut Shell<D>,
    args: &[&str],
    _: &mut dyn BufRead,
    _: &mut dyn Write,
) -> ShellResult<()> {
    let target = shell.absolute(arg(args, 1, "usage: ln TARGET LINK")?)?;
    let link = shell.absolute(arg(args, 2, "usage: ln TARGET LINK")?)?;
    shell.fs.create_link(&link, &target)?;
    Ok(())
}

fn chmod<D: BlockDevice>(
    shell: &mut Shell<D>,
    args: &[&str],
    _: &mut dyn BufRead,
    _: &mut dyn Write,
) -> ShellResult<()> {
    let permission: Permission = arg(args, 1, "usage: chmod read|write|execute PATH")?.parse()?;
    let target = shell.absolute(arg(args, 2, "usage: chmod read|write|execute PATH")?)?;
    let loc = shell.fs.resolve(&target)?;
    shell.fs.set_permission(loc, permission)?;
    Ok(())
}

fn linuxtoalpha<D: BlockDevice>(
    shell: &mut Shell<D>,
    args: &[&str],
    _: &mut dyn BufRead,
    out: &mut dyn Write,
) -> ShellResult<()> {
    let host = arg(args, 1, "usage: linuxtoalpha HOSTFILE ALPHAFILE")?;
    let file = shell.absolute(arg(args, 2, "usage: linuxtoalpha HOSTFILE ALPHAFILE")?)?;
    let data = std::fs::read(host)?;
    shell.fs.write_path(&file, &data)?;
    writeln!(out, "copied {} bytes", data.len())?;
    Ok(())
}

fn alphatolinux<D: BlockDevice>(
    shell: &mut Shell<D>,
    args: &[&str],
    _: &mut dyn BufRead,
    out: &mut dyn Write,
) -> ShellResult<()> {
    let file = shell.absolute(arg(args, 1, "usage: alphatolinux ALPHAFILE HOSTFILE")?)?;
    let host = arg(args, 2, "usage: alphatolinux ALPHAFILE HOSTFILE")?;
    let data = shell.fs.read_path(&file)?;
    std::fs::write(host, &data)?;
    writeln!(out, "copied {} bytes", data.len())?;
    Ok(())
}

fn textedit<D: BlockDevice>(
    shell: &mut Shell<D>,
    args: &[&str],
    input: &mut dyn BufRead,
    out: &mut dyn Write,
) -> ShellResult<()> {
    let file = shell.absolute(arg(args, 1, "Textedit needs a name")?)?;
    let loc = match shell.fs.lookup(&file)? {
        Some(loc) => {
            if !shell.fs.stat(loc)?.kind.has_payload() {
                return Err(AlphaError::NotAFile(loc).into());
            }
            let content = shell.fs.read_data(loc)?;
            writeln!(out, "{}", String::from_utf8_lossy(&content))?;
            loc
        }
        None => {
            writeln!(out, "Creating file")?;
            shell.fs.make_file(&file)?
        }
    };
    writeln!(out, "Start typing. Press 'enter' to finish.")?;
    out.flush()?;

    let mut line = String::new();
    input.read_line(&mut line)?;
    let text = line.trim_end_matches(['\r', '\n']);
    shell.fs.write_data(loc, text.as_bytes())?;
    Ok(())
}

fn df<D: BlockDevice>(
    shell: &mut Shell<D>,
    args: &[&str],
    _: &mut dyn BufRead,
    out: &mut dyn Write,
) -> ShellResult<()> {
    let stat = shell.fs.statfs()?;
    if args.get(1) == Some(&"--json") {
        writeln!(out, "{}", serde_json::to_string_pretty(&stat)?)?;
        return Ok(());
    }
    writeln!(out, "Volume: {}", stat.volume_name)?;
    writeln!(out, "Block Size: {}", stat.block_size)?;
    writeln!(
        out,
        "Blocks: {} total, {} used, {} free",
        stat.total_blocks, stat.used_blocks, stat.free_blocks
    )?;
    writeln!(
        out,
        "Free Runs: {} (largest {} blocks)",
        stat.free_runs, stat.largest_free_run
    )?;
    Ok(())
}

fn fsck<D: BlockDevice>(
    shell: &mut Shell<D>,
    _: &[&str],
    _: &mut dyn BufRead,
    out: &mut dyn Write,
) -> ShellResult<()> {
    let report = shell.fs.check_consistency()?;
    writeln!(
        out,
        "{} directories, {} files, {} links; {} blocks used, {} free",
        report.directories, report.files, report.links, report.used_blocks, report.free_blocks
    )?;
    if report.is_clean() {
        writeln!(out, "clean")?;
    }
    for problem in &report.problems {
        writeln!(out, "problem: {}", problem)?;
    }
    Ok(())
}

fn defrag<D: BlockDevice>(
    shell: &mut Shell<D>,
    _: &[&str],
    _: &mut dyn BufRead,
    out: &mut dyn Write,
) -> ShellResult<()> {
    let runs = shell.fs.coalesce_free_space()?;
    writeln!(out, "{} free runs", runs)?;
    Ok(())
}

fn quit<D: BlockDevice>(
    shell: &mut Shell<D>,
    _: &[&str],
    _: &mut dyn BufRead,
    _: &mut dyn Write,
) -> ShellResult<()> {
    shell.running = false;
    Ok(())
}

fn help<D: BlockDevice>(
    _: &mut Shell<D>,
    _: &[&str],
    _: &mut dyn BufRead,
    out: &mut dyn Write,
) -> ShellResult<()> {
    writeln!(out)?;
    for (usage, description) in HELP {
        writeln!(out, "{}\n    {}\n", usage, description)?;
    }
    Ok(())
}
