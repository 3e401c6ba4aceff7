use rillc::analysis::{Profile, Reducer, UseDefs};
use rillc::ast::Stmt;
use rillc::finalize::{finalize_functions, FuncInfo};
use rillc::Compiler;

use serde::Deserialize;

#[derive(Deserialize)]
struct FunctionInput {
    name: String,
    #[serde(default)]
    profile: Profile,
    #[serde(default)]
    dead_assigns: Vec<String>,
    body: Vec<Stmt>,
}

#[derive(Deserialize)]
struct ModuleInput {
    functions: Vec<FunctionInput>,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: rillc <module.json> [--json]");
        std::process::exit(1);
    }

    let path = &args[1];
    let as_json = args.iter().any(|a| a == "--json");

    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error reading {}: {}", path, e);
            std::process::exit(1);
        }
    };

    let module: ModuleInput = match serde_json::from_str(&source) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("Parse error: {}", e);
            std::process::exit(1);
        }
    };

    let reducer = Reducer;
    let mut funcs = Vec::with_capacity(module.functions.len());
    for f in &module.functions {
        let usedefs = UseDefs::with_dead_assigns(f.dead_assigns.iter().cloned());
        let body = match Compiler::compile(&f.name, &f.body, &f.profile, &usedefs, &reducer) {
            Ok(b) => b,
            Err(e) => {
                eprintln!("Compile error in {}: {}", f.name, e);
                std::process::exit(1);
            }
        };
        funcs.push(FuncInfo { name: f.name.clone(), callees: f.profile.callees.clone(), body });
    }

    finalize_functions(&mut funcs);

    if as_json {
        let bodies: Vec<_> = funcs.iter().map(|f| &f.body).collect();
        match serde_json::to_string_pretty(&bodies) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Serialization error: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        for f in &funcs {
            println!("{}", f.body);
        }
    }
}
