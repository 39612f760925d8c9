mod analysis;

use std::{
    io::Write,
    path::{Path, PathBuf},
};

use clap::{Args, Parser, Subcommand};
use eyre::{Result, WrapErr};

use analysis::{diff, summarize, Diff, Summary};

#[derive(Args, Debug)]
pub struct Output {
    #[arg(long, default_value_t = 20, help = "Number of call sites to print, 0 prints all")]
    pub top: usize,

    #[arg(long, help = "Group call stacks by their innermost N frames")]
    pub frames: Option<usize>,

    #[arg(long, help = "Print the result as json")]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct SummaryArgs {
    #[arg(help = "Dump written by loliDump")]
    pub dump: PathBuf,

    #[command(flatten)]
    pub output: Output,
}

#[derive(Args, Debug)]
pub struct DiffArgs {
    #[arg(help = "Earlier dump")]
    pub base: PathBuf,

    #[arg(help = "Later dump")]
    pub target: PathBuf,

    #[command(flatten)]
    pub output: Output,
}

#[derive(Subcommand, Debug)]
pub enum LoliSubcommand {
    #[command(about = "Live bytes and blocks per call site of one dump")]
    Summary(SummaryArgs),
    #[command(about = "Growth per call site between two dumps")]
    Diff(DiffArgs),
}

#[derive(Parser, Debug)]
#[command(version, about = "Inspect allocation dumps written by the loli profiler")]
pub struct LoliArgs {
    #[command(subcommand)]
    pub cmd: LoliSubcommand,
}

fn read_dump(path: &Path) -> Result<Vec<loli::DumpRow>> {
    loli::read_dump(path).wrap_err_with(|| format!("reading {}", path.display()))
}

fn truncate<T>(items: &mut Vec<T>, top: usize) {
    if top > 0 {
        items.truncate(top);
    }
}

impl SummaryArgs {
    fn run(&self, out: &mut impl Write) -> Result<()> {
        let rows = read_dump(&self.dump)?;

        log::debug!("{} rows read from {:?}", rows.len(), self.dump);

        let mut summary = summarize(&rows, self.output.frames);

        truncate(&mut summary.call_sites, self.output.top);

        if self.output.json {
            serde_json::to_writer_pretty(&mut *out, &summary)?;
            writeln!(out)?;
        } else {
            print_summary(out, &summary)?;
        }

        Ok(())
    }
}

impl DiffArgs {
    fn run(&self, out: &mut impl Write) -> Result<()> {
        let base = read_dump(&self.base)?;
        let target = read_dump(&self.target)?;

        let mut diff = diff(&base, &target, self.output.frames);

        truncate(&mut diff.call_sites, self.output.top);

        if self.output.json {
            serde_json::to_writer_pretty(&mut *out, &diff)?;
            writeln!(out)?;
        } else {
            print_diff(out, &diff)?;
        }

        Ok(())
    }
}

fn print_summary(out: &mut impl Write, summary: &Summary) -> std::io::Result<()> {
    writeln!(out, "{} bytes in {} blocks", summary.bytes, summary.blocks)?;
    writeln!(out, "{:>12} {:>8}  call site", "bytes", "blocks")?;

    for site in &summary.call_sites {
        writeln!(
            out,
            "{:>12} {:>8}  {}",
            site.bytes, site.blocks, site.call_site
        )?;
    }

    Ok(())
}

fn print_diff(out: &mut impl Write, diff: &Diff) -> std::io::Result<()> {
    writeln!(
        out,
        "{} -> {} bytes ({:+}), {} -> {} blocks",
        diff.base_bytes, diff.target_bytes, diff.delta_bytes, diff.base_blocks, diff.target_blocks
    )?;
    writeln!(out, "{:>12} {:>8} {:>12}  call site", "delta", "blocks", "bytes")?;

    for site in &diff.call_sites {
        writeln!(
            out,
            "{:>+12} {:>+8} {:>12}  {}",
            site.delta_bytes, site.delta_blocks, site.target_bytes, site.call_site
        )?;
    }

    Ok(())
}

fn main() -> Result<()> {
    pretty_env_logger::init();

    let root_args = LoliArgs::parse();

    let mut stdout = std::io::stdout().lock();

    let result = match root_args.cmd {
        LoliSubcommand::Summary(args) => args.run(&mut stdout),
        LoliSubcommand::Diff(args) => args.run(&mut stdout),
    };

    if let Err(err) = &result {
        log::error!("{:#}", err);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_dump(name: &str, content: &str) -> PathBuf {
        let path =
            std::env::temp_dir().join(format!("loli-cli-{}-{}", std::process::id(), name));

        std::fs::write(&path, content).unwrap();

        path
    }

    fn output(top: usize, json: bool) -> Output {
        Output {
            top,
            frames: None,
            json,
        }
    }

    #[test]
    fn parse_arguments() {
        let args = LoliArgs::try_parse_from([
            "loli", "diff", "a.csv", "b.csv", "--top", "5", "--json",
        ])
        .unwrap();

        match args.cmd {
            LoliSubcommand::Diff(diff) => {
                assert_eq!(diff.base, PathBuf::from("a.csv"));
                assert_eq!(diff.target, PathBuf::from("b.csv"));
                assert_eq!(diff.output.top, 5);
                assert!(diff.output.json);
            }
            _ => panic!("expect diff"),
        }

        assert!(LoliArgs::try_parse_from(["loli", "summary"]).is_err());
    }

    #[test]
    fn summary_text() {
        let dump = write_dump(
            "summary.csv",
            "0x1000,600,0xa;0xb,10\n0x2000,700,0xc,20\n0x3000,100,0xa;0xb,30\n",
        );

        let args = SummaryArgs {
            dump: dump.clone(),
            output: output(1, false),
        };

        let mut out = vec![];

        args.run(&mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines = text.lines().collect::<Vec<_>>();

        assert_eq!(lines[0], "1400 bytes in 3 blocks");
        assert_eq!(lines.len(), 3);
        assert!(lines[2].ends_with("0xc"));

        std::fs::remove_file(dump).unwrap();
    }

    #[test]
    fn diff_json() {
        let base = write_dump("base.csv", "0x1000,600,0xa,10\n");
        let target = write_dump("target.csv", "0x1000,600,0xa,10\n0x2000,512,0xb,20\n");

        let args = DiffArgs {
            base: base.clone(),
            target: target.clone(),
            output: output(0, true),
        };

        let mut out = vec![];

        args.run(&mut out).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();

        assert_eq!(value["delta_bytes"], 512);
        assert_eq!(value["call_sites"][0]["call_site"], "0xb");
        assert_eq!(value["call_sites"].as_array().unwrap().len(), 1);

        std::fs::remove_file(base).unwrap();
        std::fs::remove_file(target).unwrap();
    }

    #[test]
    fn missing_dump_is_an_error() {
        let args = SummaryArgs {
            dump: PathBuf::from("/nonexistent/loli.csv"),
            output: output(0, false),
        };

        let err = args.run(&mut vec![]).unwrap_err();

        assert!(err.to_string().contains("/nonexistent/loli.csv"));
        assert!(err.downcast_ref::<loli::LoliError>().is_some());
    }
}
