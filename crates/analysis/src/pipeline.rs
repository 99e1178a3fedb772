//! Pipeline orchestration.
//!
//! `static analysis`: bytecode file → CFG → paths → lifted paths →
//! semantic units, written as NDJSON next to the input, plus the analyzer
//! state dump the transaction analyzer reloads.
//!
//! `transaction analysis`: a pre-fetched depth-filtered trace → the single
//! witnessed path through the same lifting and extraction machinery.

use std::path::Path;

use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use sema_lift::cfg::{Cfg, EvmPath, ExitSpec};
use sema_lift::destack::transform_path;
use sema_lift::disasm::{detect_language, disassemble, Language};
use sema_lift::explorer::{resolve_dynamic_edges, ExploreLimits};
use sema_lift::tac::TacPath;
use sema_lift::trace::{operations_from_trace, parse_trace};

use crate::extract::extract_semantic_units;
use crate::functions::{analyze_functions, load_signature_names, Function};
use crate::sha3::Sha3Table;
use crate::state_vars::extract_state_variables;
use crate::storage::Analyzer;
use crate::tree::TreeArena;
use crate::units::{dump_unit, dump_var, load_tree, SemanticUnit};
use crate::vars::{EvmVar, StateInfo, StateRef, VarRegistry};

/// Fatal pipeline failures: missing inputs or malformed JSON.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Tunables of one run.
#[derive(Debug, Clone, Copy)]
pub struct AnalysisOptions {
    pub limits: ExploreLimits,
    pub check_feasibility: bool,
    /// Lookahead of the exit-block join search.
    pub exit_lookahead: usize,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        AnalysisOptions {
            limits: ExploreLimits::default(),
            check_feasibility: true,
            exit_lookahead: 20,
        }
    }
}

/// Everything one run produces.
pub struct AnalysisResult {
    pub analyzer: Analyzer,
    pub units: Vec<SemanticUnit>,
    pub functions: Vec<Function>,
    pub language: Language,
}

/// Run the full static pipeline over a bytecode hex string.
pub fn analyze_bytecode(
    bytecode: &str,
    options: &AnalysisOptions,
    sha3_table: Sha3Table,
    signature_names: &FxHashMap<String, String>,
) -> AnalysisResult {
    let ops = disassemble(bytecode);
    let language = detect_language(&ops);
    info!(?language, ops = ops.len(), "disassembled contract");

    let mut cfg = Cfg::from_ops(ops);
    cfg.resolve_static_edges();
    resolve_dynamic_edges(&mut cfg, options.limits);
    info!(
        blocks = cfg.blocks.len(),
        paths = cfg.paths.len(),
        "control flow explored"
    );

    // Lift each explored path, shortest first.
    let mut evm_paths = cfg.paths.clone();
    evm_paths.sort_by_key(|p| p.blocks.len());
    let code = bytecode_bytes(bytecode);
    let mut tac_paths: Vec<TacPath> = Vec::new();
    for evm_path in &evm_paths {
        match transform_path(&mut cfg, evm_path, Some(code.clone())) {
            Ok(paths) => tac_paths.extend(paths.into_iter().filter(|p| !p.illegal)),
            Err(error) => debug!(%error, "path discarded during lifting"),
        }
    }
    info!(lifted = tac_paths.len(), "paths lifted to three-address form");

    // Jump repair may have minted paths the explorer never saw; the join
    // analysis wants all of them.
    let mut seen: rustc_hash::FxHashSet<Vec<usize>> = cfg.paths.iter().map(|p| p.key(&cfg)).collect();
    for tac_path in &tac_paths {
        let blocks: Vec<_> = tac_path.blocks.iter().map(|b| b.evm_block).collect();
        let path = EvmPath {
            blocks,
            ..Default::default()
        };
        if seen.insert(path.key(&cfg)) {
            cfg.paths.push(path);
        }
    }

    cfg.update_fallthrough_kinds();
    let exit_blocks = cfg.resolve_exit_blocks(&cfg.paths, options.exit_lookahead);

    let functions = analyze_functions(&cfg, &mut tac_paths, signature_names);

    let mut analyzer = Analyzer::new(TreeArena::new(sha3_table), VarRegistry::new(language));

    // Accessor paths first: they name variables the behavior paths write.
    for path in &tac_paths {
        if path.has_state_affecting_op() {
            continue;
        }
        let Some(function) = path.function.and_then(|f| functions.get(f)) else {
            continue;
        };
        if let Err(error) = extract_state_variables(&mut analyzer, path, function) {
            debug!(%error, "state variable recovery abandoned on path");
        }
    }

    let units = extract_all_units(
        &mut analyzer,
        &mut tac_paths,
        &functions,
        &exit_blocks,
        options.check_feasibility,
    );

    AnalysisResult {
        analyzer,
        units,
        functions,
        language,
    }
}

/// Extract and deduplicate units across paths. Re-occurrences of a unit
/// (loop unrollings) collapse onto the first with `with_loops` set.
fn extract_all_units(
    analyzer: &mut Analyzer,
    tac_paths: &mut [TacPath],
    functions: &[Function],
    exit_blocks: &FxHashMap<usize, ExitSpec>,
    check_feasibility: bool,
) -> Vec<SemanticUnit> {
    let mut order: Vec<usize> = (0..tac_paths.len()).collect();
    order.sort_by_key(|i| tac_paths[*i].blocks.len());

    let mut units: Vec<SemanticUnit> = Vec::new();
    let mut by_render: FxHashMap<String, usize> = FxHashMap::default();

    for idx in order {
        let path = &mut tac_paths[idx];
        if !path.has_state_affecting_op() {
            continue;
        }
        let function_tag = path
            .function
            .and_then(|f| functions.get(f))
            .map(|f| f.tag())
            .unwrap_or_else(|| "0x_0x".to_string());
        analyzer.reset_path_sensitive();
        let extracted =
            match extract_semantic_units(analyzer, path, &function_tag, exit_blocks, check_feasibility)
            {
                Ok(extracted) => extracted,
                Err(error) => {
                    debug!(%error, "unit extraction abandoned on path");
                    continue;
                }
            };
        for unit in extracted {
            let key = unit.rendered(&analyzer.arena, &analyzer.registry);
            match by_render.get(&key) {
                Some(&existing) => {
                    units[existing].with_loops = true;
                    units[existing]
                        .belong_functions
                        .extend(unit.belong_functions.iter().cloned());
                }
                None => {
                    by_render.insert(key, units.len());
                    units.push(unit);
                }
            }
        }
    }
    units
}

fn bytecode_bytes(bytecode: &str) -> bytes::Bytes {
    let normalized = sema_lift::disasm::normalize_hex(bytecode);
    let stripped = sema_lift::disasm::strip_metadata(&normalized);
    bytes::Bytes::from(hex::decode(stripped).unwrap_or_default())
}

// ─── Analyzer state dump / reload ───────────────────────────────────────

fn dump_state_info(info: &StateInfo) -> Value {
    json!({
        "index": info.index.to_string(),
        "offset": info.offset,
        "length": info.length,
        "type": { "type_name": info.ty.to_string() },
        "is_public": info.is_public,
        "signature": info.signature,
        "name": info.name,
    })
}

/// Serialize the canonical variable state for later transaction runs.
pub fn dump_analyzer(analyzer: &Analyzer, language: Language) -> Value {
    let states: Vec<Value> = analyzer.registry.states.iter().map(dump_state_info).collect();
    let occupied: Vec<String> = {
        let mut keys: Vec<String> = analyzer
            .registry
            .dynamic_occupied
            .iter()
            .map(|k| k.to_string())
            .collect();
        keys.sort();
        keys
    };
    let memo: serde_json::Map<String, Value> = {
        let mut entries: Vec<(&String, &EvmVar)> = analyzer.registry.memo.iter().collect();
        entries.sort_by_key(|(k, _)| (*k).clone());
        entries
            .into_iter()
            .filter(|(_, v)| matches!(v, EvmVar::State(_)))
            .map(|(k, v)| (k.clone(), dump_var(&analyzer.arena, &analyzer.registry, v)))
            .collect()
    };
    json!({
        "EVMVariables": {
            "language": match language { Language::Vyper => "Vyper", Language::Solidity => "Solidity" },
            "evm_states": states,
            "evm_storage_dynamic_occupied": occupied,
            "has_analyzed_trees": memo,
        }
    })
}

fn parse_u256_field(value: &Value) -> Option<ethereum_types::U256> {
    match value {
        Value::String(s) => {
            if let Some(hex_part) = s.strip_prefix("0x") {
                ethereum_types::U256::from_str_radix(hex_part, 16).ok()
            } else {
                ethereum_types::U256::from_dec_str(s).ok()
            }
        }
        Value::Number(n) => n.as_u64().map(ethereum_types::U256::from),
        _ => None,
    }
}

/// Rebuild an analyzer from a previous run's dump.
pub fn load_analyzer(dump: &Value, sha3_table: Sha3Table) -> Analyzer {
    let vars = &dump["EVMVariables"];
    let language = match vars["language"].as_str() {
        Some("Vyper") => Language::Vyper,
        _ => Language::Solidity,
    };
    let mut registry = VarRegistry::new(language);
    let mut arena = TreeArena::new(sha3_table);

    if let Some(states) = vars["evm_states"].as_array() {
        for state in states {
            let Some(index) = parse_u256_field(&state["index"]) else {
                continue;
            };
            let offset = state["offset"].as_u64().map(|v| v as u32);
            let length = state["length"].as_u64().map(|v| v as u32);
            let ty = state["type"]["type_name"]
                .as_str()
                .map(crate::types::EvmType::from_name)
                .unwrap_or_default();
            let id = registry.get_or_insert_state(index, offset, length, ty);
            let info = registry.state_mut(id);
            info.is_public = state["is_public"].as_bool().unwrap_or(false);
            info.signature = state["signature"].as_str().unwrap_or_default().to_string();
            info.name = state["name"].as_str().map(str::to_string);
        }
    }
    if let Some(occupied) = vars["evm_storage_dynamic_occupied"].as_array() {
        for entry in occupied {
            if let Some(index) = parse_u256_field(entry) {
                registry.dynamic_occupied.insert(index);
            }
        }
    }
    if let Some(memo) = vars["has_analyzed_trees"].as_object() {
        for (render, var) in memo {
            let Some(index) = parse_u256_field(&var["index"]) else {
                continue;
            };
            let offset = var["offset"].as_u64().map(|v| v as u32);
            let length = var["length"].as_u64().map(|v| v as u32);
            let ty = var["type"]["type_name"]
                .as_str()
                .map(crate::types::EvmType::from_name)
                .unwrap_or_default();
            let id = registry.get_or_insert_state(index, offset, length, ty);
            let keys = var["keys"]
                .as_array()
                .map(|list| {
                    list.iter()
                        .filter_map(|k| load_tree(&mut arena, k))
                        .collect()
                })
                .unwrap_or_default();
            registry.memo.insert(
                render.clone(),
                EvmVar::State(StateRef {
                    id,
                    keys,
                    counts: 0,
                }),
            );
        }
    }

    Analyzer::new(arena, registry)
}

// ─── Entry points over the working directory ────────────────────────────

/// Analyze `<working_dir>/<address>.hex` and write `semantic_units.json`
/// (NDJSON) and `evm_analyzer.json` beside it.
pub fn static_analysis(
    address: &str,
    working_dir: &Path,
    options: &AnalysisOptions,
) -> Result<AnalysisResult, PipelineError> {
    let input = working_dir.join(format!("{address}.hex"));
    info!(input = %input.display(), "reading bytecode");
    let bytecode = std::fs::read_to_string(&input)?;

    let sha3_table = Sha3Table::load_from_dir(working_dir)?;
    let signature_names = load_signature_names(working_dir);

    let result = analyze_bytecode(&bytecode, options, sha3_table, &signature_names);
    info!(units = result.units.len(), "semantic units extracted");

    write_units(
        &result,
        &working_dir.join("semantic_units.json"),
        false,
    )?;
    let dump = dump_analyzer(&result.analyzer, result.language);
    std::fs::write(
        working_dir.join("evm_analyzer.json"),
        serde_json::to_string_pretty(&dump)?,
    )?;
    Ok(result)
}

/// Analyze the pre-fetched trace of one transaction against the analyzer
/// state of a prior static run.
pub fn transaction_analysis(
    transaction_hash: &str,
    working_dir: &Path,
) -> Result<AnalysisResult, PipelineError> {
    let trace_path = working_dir.join(format!("{transaction_hash}.trace.json"));
    info!(input = %trace_path.display(), "reading transaction trace");
    let raw = std::fs::read_to_string(&trace_path)?;
    let steps = parse_trace(&raw)?;
    let ops = operations_from_trace(&steps);

    let sha3_table = Sha3Table::load_from_dir(working_dir)?;
    let mut analyzer = match std::fs::read_to_string(working_dir.join("evm_analyzer.json")) {
        Ok(dump_raw) => {
            let dump: Value = serde_json::from_str(&dump_raw)?;
            load_analyzer(&dump, sha3_table)
        }
        Err(_) => {
            warn!("no analyzer state found, starting empty");
            Analyzer::new(TreeArena::new(sha3_table), VarRegistry::default())
        }
    };
    let language = analyzer.registry.language;

    let mut cfg = Cfg::from_ops(ops);
    let completed = cfg
        .blocks
        .last()
        .is_some_and(|b| matches!(b.last_op().opcode, sema_lift::opcodes::Opcode::RETURN | sema_lift::opcodes::Opcode::STOP));
    if !completed {
        warn!("transaction did not complete normally, skipping analysis");
        return Ok(AnalysisResult {
            analyzer,
            units: Vec::new(),
            functions: Vec::new(),
            language,
        });
    }

    let evm_path = EvmPath {
        blocks: (0..cfg.blocks.len()).map(sema_lift::cfg::BlockId).collect(),
        from_transaction: true,
        ..Default::default()
    };
    let mut tac_paths = match transform_path(&mut cfg, &evm_path, None) {
        Ok(paths) => paths,
        Err(error) => {
            warn!(%error, "trace could not be lifted");
            Vec::new()
        }
    };

    let signature_names = load_signature_names(working_dir);
    let functions = analyze_functions(&cfg, &mut tac_paths, &signature_names);

    let exit_blocks = FxHashMap::default();
    let units = extract_all_units(&mut analyzer, &mut tac_paths, &functions, &exit_blocks, false);
    info!(units = units.len(), "transaction semantic units extracted");

    let result = AnalysisResult {
        analyzer,
        units,
        functions,
        language,
    };
    write_units(
        &result,
        &working_dir.join("transaction_semantic_units.json"),
        true,
    )?;
    Ok(result)
}

/// Write units as newline-delimited JSON.
pub fn write_units(result: &AnalysisResult, path: &Path, append: bool) -> Result<(), PipelineError> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)?;
    for unit in &result.units {
        let value = dump_unit(&result.analyzer.arena, &result.analyzer.registry, unit);
        writeln!(file, "{}", serde_json::to_string(&value)?)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(bytecode: &str) -> AnalysisResult {
        analyze_bytecode(
            bytecode,
            &AnalysisOptions::default(),
            Sha3Table::default(),
            &FxHashMap::default(),
        )
    }

    #[test]
    fn unconditional_store_yields_one_unit() {
        // PUSH1 1; PUSH1 0; SSTORE; STOP
        let result = run("600160005500");
        assert_eq!(result.units.len(), 1);
        let unit = &result.units[0];
        assert!(unit.conditions.is_empty());
        assert_eq!(unit.behavior.behavior_pcs, vec![4]);
    }

    #[test]
    fn determinism_across_runs() {
        let bytecode = "6080604052348015600f57600080fd5b50600160005500";
        let a = run(bytecode);
        let b = run(bytecode);
        let render = |r: &AnalysisResult| -> Vec<String> {
            r.units
                .iter()
                .map(|u| u.rendered(&r.analyzer.arena, &r.analyzer.registry))
                .collect()
        };
        assert_eq!(render(&a), render(&b));
    }
}
