use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use module_walker::apiset::ApiSetSchema;
use module_walker::cache::{ModuleFlag, ModuleInfo, ModulesCache};
use module_walker::imports::ImportContextBuilder;
use module_walker::pe::{demangle_symbol, BinaryCache, DiskLocator};
use module_walker::search::{ModuleResolver, ModuleSearchStrategy};
use module_walker::sxs::SxsEntries;
use module_walker::system::WindowsSystem;
use module_walker::tree::{DependencyTree, NodeId};
use module_walker::{
    decanonicalize, path_to_string, readable_canonical_path, ScanObserver, ScanQuery, ScanSession,
    TreePolicy,
};

/// Simulate the Windows loader and walk a PE dependency tree
#[derive(Parser, Debug)]
#[command(name = "modwalk", version, about)]
struct Cli {
    /// Target file (.exe or .dll)
    input: PathBuf,

    /// Maximum recursion depth (default: bounded only by the safety ceiling)
    #[arg(short = 'd', long)]
    max_depth: Option<usize>,

    /// How far to expand the tree eagerly
    #[arg(long, value_enum, default_value_t = TreePolicy::RecursiveOnlyOnDirectImports)]
    policy: TreePolicy,

    /// Working directory to be considered in the DLL lookup path
    /// (default: the directory of the target)
    #[arg(short = 'k', long)]
    workdir: Option<PathBuf>,

    /// Additional search folders, separated by ';'
    #[arg(short = 'a', long = "userpath", value_delimiter = ';')]
    user_path: Vec<PathBuf>,

    /// Windows partition to use for system DLL lookup (default: deduced
    /// from the target location)
    #[arg(short = 'w', long)]
    windows_root: Option<PathBuf>,

    /// JSON dump of the api set schema ("contract": "backing.dll")
    #[arg(long)]
    apiset_json: Option<PathBuf>,

    /// Path for output in JSON format
    #[arg(short = 'j', long)]
    output_json_path: Option<PathBuf>,

    /// Include system DLLs in the output
    #[arg(long)]
    print_system_dlls: bool,

    /// Check that all imported symbols are found within the dependencies
    #[arg(long)]
    check_symbols: bool,

    /// Verbosity level
    #[arg(short, long)]
    verbose: bool,
}

struct ProgressReporter;

impl ScanObserver for ProgressReporter {
    fn module_discovered(&mut self, module: &Arc<ModuleInfo>) {
        tracing::debug!(module = %module.name, strategy = %module.strategy, "module discovered");
    }

    fn working(&mut self, in_flight: usize) {
        tracing::trace!(in_flight, "expansion in flight");
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if !cli.input.exists() {
        anyhow::bail!(
            "specified file not found at {}\ncurrent working directory: {}",
            cli.input.display(),
            std::env::current_dir()?.display()
        );
    }
    if cli.input.is_dir() {
        anyhow::bail!(
            "the specified path is a directory, not a PE executable file: {}",
            cli.input.display()
        );
    }

    let mut query =
        ScanQuery::deduce_from_binary_location(&cli.input).context("building the scan query")?;
    query.policy = cli.policy;
    query.max_depth = cli.max_depth;
    if let Some(workdir) = &cli.workdir {
        query.working_dir = workdir.clone();
    }
    for entry in &cli.user_path {
        if entry.exists() {
            query.custom_search_folders.push(fs_err::canonicalize(entry)?);
        } else {
            eprintln!("skipping non-existing path entry {}", entry.display());
        }
    }

    // overrides (must be last)
    if let Some(root) = &cli.windows_root {
        query.system = WindowsSystem::from_root(root);
        if query.system.is_none() {
            anyhow::bail!("no Windows installation found at {}", root.display());
        }
    } else if cli.verbose && query.system.is_none() {
        println!(
            "Windows partition root not specified, and the target doesn't lie in one; \
             system DLL imports will not be resolved"
        );
    }
    if let Some(apiset_json) = &cli.apiset_json {
        let schema = ApiSetSchema::from_json_file(apiset_json).context("loading api set schema")?;
        match query.system.as_mut() {
            Some(system) => system.apiset = Some(schema),
            None => anyhow::bail!("--apiset-json requires a resolvable Windows system"),
        }
    }

    if cli.verbose {
        println!(
            "Looking for dependencies of binary {}",
            readable_canonical_path(&cli.input)?
        );
        if let Some(system) = &query.system {
            println!("System directory: {}", path_to_string(&system.sys_dir));
            if system.apiset.is_some() {
                println!("API set schema available");
            }
            if let Some(kd) = &system.known_dlls {
                println!("Known DLLs: {:?}", kd.names().collect::<Vec<_>>());
            }
        }
        println!();
    }

    let locator = Arc::new(DiskLocator::new());
    let sxs = SxsEntries::collect_for_binary(locator.as_ref(), &query.target);
    let resolver = Arc::new(ModuleResolver::new(query, sxs, BinaryCache::new(locator)));
    let builder = Arc::new(ImportContextBuilder::new(resolver));
    let mut session = ScanSession::new(builder).with_observer(Box::new(ProgressReporter));

    let root = session.run().context("dependency scan failed")?;
    let outcome = session.into_outcome(root);

    println!();
    print_tree(&outcome.tree, outcome.root, cli.print_system_dlls);

    print_unresolved(&outcome.modules);

    if cli.check_symbols {
        print_check_report(&outcome.modules);
    }

    if let Some(json_path) = &cli.output_json_path {
        write_json_report(&outcome.tree, outcome.root, &outcome.modules, json_path)?;
        if cli.verbose {
            println!("successfully wrote {}", json_path.display());
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("module_walker=debug,modwalk=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn node_tags(module: &ModuleInfo) -> String {
    let mut tags = Vec::new();
    let flags = module.flags();
    if flags.contains(ModuleFlag::DELAY_LOAD) {
        tags.push("delay-load".to_owned());
    }
    if flags.contains(ModuleFlag::API_SET) {
        match &module.apiset_backing {
            Some(backing) => tags.push(format!("api-set -> {}", backing)),
            None => tags.push("api-set".to_owned()),
        }
    }
    if module.strategy == ModuleSearchStrategy::WellKnownDlls {
        tags.push("known dll".to_owned());
    }
    if module.strategy == ModuleSearchStrategy::AppInitDLL {
        tags.push("appinit".to_owned());
    }
    if module.strategy == ModuleSearchStrategy::ClrAssembly {
        tags.push("clr".to_owned());
    }
    if flags.contains(ModuleFlag::MISSING_IMPORTS) {
        tags.push("missing imports!".to_owned());
    }
    if flags.contains(ModuleFlag::CHILDREN_ERROR) {
        tags.push("children error!".to_owned());
    }
    if tags.is_empty() {
        String::new()
    } else {
        format!(" [{}]", tags.join(", "))
    }
}

fn print_tree(tree: &DependencyTree, root: NodeId, print_system_dlls: bool) {
    fn visit(tree: &DependencyTree, id: NodeId, print_system_dlls: bool) {
        let node = tree.node(id);
        let module = node.module();
        if node.depth() > 0 && module.strategy.is_system() && !print_system_dlls {
            return;
        }

        let location = match &module.filepath {
            Some(path) => path
                .parent()
                .map(|p| decanonicalize(&path_to_string(p)))
                .unwrap_or_else(|| "?".to_owned()),
            None => "not found".to_owned(),
        };
        let suffix = if node.has_unrealized_children() {
            " (+)"
        } else {
            ""
        };
        println!(
            "{}{} => {}{}{}",
            "\t".repeat(node.depth()),
            module.name,
            location,
            node_tags(module),
            suffix
        );

        for &child in node.children() {
            visit(tree, child, print_system_dlls);
        }
    }

    visit(tree, root, print_system_dlls);
}

fn print_unresolved(modules: &ModulesCache) {
    // extension api sets are suppressed: unresolvable by design on most systems
    let unresolved: Vec<&Arc<ModuleInfo>> = modules
        .modules()
        .filter(|m| !m.found() && !m.flags().contains(ModuleFlag::API_SET_EXT))
        .collect();
    if unresolved.is_empty() {
        return;
    }
    println!("\nUnresolved modules:");
    for module in unresolved {
        println!("\t{} [{}]", module.name, module.flags().names().join("|"));
    }
}

fn print_check_report(modules: &ModulesCache) {
    println!("\nChecking symbols...\n");
    let report = modules.check();
    if report.is_clean() {
        println!("No missing libraries or symbols detected");
        return;
    }

    if !report.not_found_libraries.is_empty() {
        println!("Missing libraries detected!");
        println!("[importing module, missing dependencies]\n");
        for (importer, missing) in &report.not_found_libraries {
            println!("{}", importer);
            for dependency in missing {
                println!("\t{}", dependency);
            }
        }
        println!();
    }

    if !report.not_found_symbols.is_empty() {
        println!("Missing symbols detected!");
        println!("[importing module, exporting module, missing symbols]\n");
        for (importer, by_exporter) in &report.not_found_symbols {
            println!("{}", importer);
            for (exporter, symbols) in by_exporter {
                println!("\t{}", exporter);
                for symbol in symbols {
                    println!(
                        "\t\t{}",
                        demangle_symbol(symbol).as_deref().unwrap_or(symbol)
                    );
                }
            }
        }
    }
}

#[derive(serde::Serialize)]
struct ModuleReport<'a> {
    name: &'a str,
    filepath: Option<String>,
    strategy: ModuleSearchStrategy,
    flags: Vec<&'static str>,
    depth_first_appearance: Option<usize>,
}

fn write_json_report(
    tree: &DependencyTree,
    root: NodeId,
    modules: &ModulesCache,
    json_path: &std::path::Path,
) -> anyhow::Result<()> {
    use std::collections::HashMap;

    // shallowest tree position per module record
    let mut depths: HashMap<*const ModuleInfo, usize> = HashMap::new();
    tree.visit_depth_first(root, &mut |_, node| {
        let key = Arc::as_ptr(node.module());
        let depth = node.depth();
        depths
            .entry(key)
            .and_modify(|d| *d = (*d).min(depth))
            .or_insert(depth);
    });

    let report: Vec<ModuleReport> = modules
        .modules()
        .map(|m| ModuleReport {
            name: &m.name,
            filepath: m.filepath.as_deref().map(path_to_string),
            strategy: m.strategy,
            flags: m.flags().names(),
            depth_first_appearance: depths.get(&Arc::as_ptr(m)).copied(),
        })
        .collect();

    let js = serde_json::to_string_pretty(&report).context("error serializing")?;
    let mut file = fs_err::File::create(json_path)
        .with_context(|| format!("couldn't create {}", json_path.display()))?;
    file.write_all(js.as_bytes())
        .with_context(|| format!("couldn't write to {}", json_path.display()))?;
    Ok(())
}
