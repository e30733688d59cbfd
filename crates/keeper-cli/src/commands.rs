use std::fs::File;
use std::io::{self, Write};

use anyhow::{bail, Context};
use colored::Colorize;
use keeper::{Keeper, KeeperConfig, MetaOptions, MetaValue};
use keeper_types::Key;

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let keeper = open_keeper(&cli)?;
    let result = match cli.command {
        Command::Put(args) => cmd_put(&keeper, args),
        Command::PutText(args) => cmd_put_text(&keeper, args),
        Command::Get(args) => cmd_get(&keeper, args),
        Command::Meta(args) => cmd_meta(&keeper, args),
        Command::Contains(args) => cmd_contains(&keeper, args),
        Command::Delete(args) => cmd_delete(&keeper, args),
        Command::List => cmd_list(&keeper),
        Command::Count => {
            println!("{}", keeper.len()?);
            Ok(())
        }
    };
    keeper.close().context("closing store")?;
    result
}

fn open_keeper(cli: &Cli) -> anyhow::Result<Keeper> {
    let mut config = match &cli.config {
        Some(path) => KeeperConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => KeeperConfig::default(),
    };
    if let Some(root) = &cli.root {
        config.root = root.clone();
    }
    if let Some(workers) = cli.cache_workers {
        config = config.with_write_cache(workers);
    }
    Keeper::open(&config).with_context(|| format!("opening store at {}", config.root.display()))
}

fn parse_key(text: &str) -> anyhow::Result<Key> {
    text.parse().with_context(|| format!("invalid key '{text}'"))
}

fn parse_extension_value(raw: &str) -> MetaValue {
    match raw {
        "null" => MetaValue::Null,
        "true" => MetaValue::Bool(true),
        "false" => MetaValue::Bool(false),
        _ => raw
            .parse::<i64>()
            .map_or_else(|_| MetaValue::Text(raw.to_owned()), MetaValue::Int),
    }
}

fn meta_options(args: MetaArgs) -> anyhow::Result<MetaOptions> {
    let mut options = MetaOptions::new();
    if let Some(mime) = args.mime {
        options = options.with_mime(mime);
    }
    for ext in &args.extensions {
        let Some((name, value)) = ext.split_once('=') else {
            bail!("extension '{ext}' is not NAME=VALUE");
        };
        options = options.with_extension(name, parse_extension_value(value));
    }
    Ok(options)
}

fn cmd_put(keeper: &Keeper, args: PutArgs) -> anyhow::Result<()> {
    let mut options = meta_options(args.meta)?;
    if let Some(encoding) = args.encoding {
        options = options.with_encoding(encoding);
    }
    let mut stream = keeper.add_stream(options)?;
    if args.path.as_os_str() == "-" {
        io::copy(&mut io::stdin().lock(), &mut stream).context("reading stdin")?;
    } else {
        let mut file = File::open(&args.path)
            .with_context(|| format!("opening {}", args.path.display()))?;
        io::copy(&mut file, &mut stream)
            .with_context(|| format!("reading {}", args.path.display()))?;
    }
    let key = stream.close()?;
    println!("{} {}", "✓".green().bold(), key.to_string().yellow());
    Ok(())
}

fn cmd_put_text(keeper: &Keeper, args: PutTextArgs) -> anyhow::Result<()> {
    let key = keeper.put(args.text, meta_options(args.meta)?)?;
    println!("{} {}", "✓".green().bold(), key.to_string().yellow());
    Ok(())
}

fn cmd_get(keeper: &Keeper, args: GetArgs) -> anyhow::Result<()> {
    let key = parse_key(&args.key)?;
    let value = keeper.get(&key)?;
    let mut reader = value.as_reader()?;
    match &args.output {
        Some(path) => {
            let mut file = File::create(path)
                .with_context(|| format!("creating {}", path.display()))?;
            io::copy(&mut reader, &mut file)?;
            eprintln!("{} wrote {} bytes to {}", "✓".green(), value.len(), path.display());
        }
        None => {
            let mut stdout = io::stdout().lock();
            io::copy(&mut reader, &mut stdout)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

fn cmd_meta(keeper: &Keeper, args: KeyArgs) -> anyhow::Result<()> {
    let key = parse_key(&args.key)?;
    let value = keeper.get(&key)?;
    println!("{} {}", "key".bold(), key.to_string().yellow());
    for name in value.meta().attribute_names() {
        if let Some(attribute) = value.meta().attribute(name) {
            println!("  {}: {}", name.cyan(), attribute);
        }
    }
    if let Some(path) = value.path() {
        println!("  {}: {}", "path".dimmed(), path.display());
    }
    Ok(())
}

fn cmd_contains(keeper: &Keeper, args: KeyArgs) -> anyhow::Result<()> {
    let key = parse_key(&args.key)?;
    if !keeper.contains(&key)? {
        bail!("{key} is not present");
    }
    println!("{} present", "✓".green());
    Ok(())
}

fn cmd_delete(keeper: &Keeper, args: KeyArgs) -> anyhow::Result<()> {
    let key = parse_key(&args.key)?;
    keeper.delete(&key)?;
    println!("{} Deleted {}", "✓".green(), key.to_string().yellow());
    Ok(())
}

fn cmd_list(keeper: &Keeper) -> anyhow::Result<()> {
    for key in keeper.keys()? {
        println!("{}", key?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_values_are_typed() {
        assert_eq!(parse_extension_value("null"), MetaValue::Null);
        assert_eq!(parse_extension_value("true"), MetaValue::Bool(true));
        assert_eq!(parse_extension_value("-12"), MetaValue::Int(-12));
        assert_eq!(parse_extension_value("v1.2"), MetaValue::Text("v1.2".into()));
    }

    #[test]
    fn extensions_need_a_name() {
        let args = MetaArgs {
            mime: Some("a/b".into()),
            extensions: vec!["author=rjs".into(), "broken".into()],
        };
        assert!(meta_options(args).is_err());

        let args = MetaArgs {
            mime: None,
            extensions: vec!["rev=3".into()],
        };
        let options = meta_options(args).unwrap();
        assert_eq!(options.extensions(), &[("rev".to_owned(), MetaValue::Int(3))]);
    }

    #[test]
    fn keys_must_be_lowercase_hex() {
        assert!(parse_key("ABC").is_err());
        let key = Key::derive(b"x", b"");
        assert_eq!(parse_key(&key.to_hex()).unwrap(), key);
    }
}
