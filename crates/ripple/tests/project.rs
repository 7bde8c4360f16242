//! Whole-project builds: directories, configuration, the module cache and the
//! build-time checks.

use std::{fs, path::Path};

use pretty_assertions::assert_eq;
use ripple::{
    ArtifactError, BuildConfig, BuildError, LeakKind, LinkErrorKind, ModuleGraph, Origin, Program, Vm, build_dir,
    build_project, bytecode::MAGIC, cache::ModuleCache, compile_source, compile_sources,
};

fn write(root: &Path, relative: &str, source: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, source).unwrap();
}

fn sample_project(root: &Path) {
    write(root, "api/__init__.py", "");
    write(
        root,
        "api/users.py",
        "import os\n\nTOKEN = os.environ\n\n@rpc\ndef count_users():\n    return 3\n",
    );
    write(root, "ui/theme.py", "card = Style(padding=4)\n");
    write(
        root,
        "app.py",
        "from api.users import count_users\nfrom ui.theme import card\n\ntotal = Signal(None)\n\n@component\ndef App():\n    Text(str(total.value), style=card)\n\nApp()\ntotal.value = count_users()\n",
    );
}

#[test]
fn directory_build_classifies_and_runs() {
    let dir = tempfile::tempdir().unwrap();
    sample_project(dir.path());

    let output = build_project(dir.path()).unwrap();
    assert_eq!(output.classification.entries(), ["app".to_owned()]);
    assert_eq!(output.classification.origin("api.users.TOKEN"), Origin::Server);
    assert!(output.classification.is_remote("api.users.count_users"));
    assert_eq!(output.remote_functions, vec!["api.users.count_users".to_owned()]);
    assert_eq!(output.styles.len(), 1);

    let mut vm = Vm::new(output.program().unwrap());
    vm.run().unwrap();
    let request = vm.take_requests().remove(0);
    assert_eq!(request.function, "api.users.count_users");
    vm.resolve_remote(request.id, Ok(serde_json::json!(3))).unwrap();
    assert_eq!(vm.tree().texts(), vec!["3"]);
}

#[test]
fn configuration_file_is_honored() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "ripple.toml", "entries = [\"home\"]\nparallel = false\n");
    write(dir.path(), "home.py", "Text('home')\n");
    write(dir.path(), "other.py", "@component\ndef Other():\n    Text('other')\n");

    let output = build_project(dir.path()).unwrap();
    assert_eq!(output.classification.entries(), ["home".to_owned()]);

    write(dir.path(), "ripple.toml", "entrys = []\n");
    let err = build_project(dir.path()).unwrap_err();
    assert!(matches!(err, BuildError::Config(_)), "{err}");
}

#[test]
fn cache_skips_unchanged_modules() {
    let dir = tempfile::tempdir().unwrap();
    sample_project(dir.path());
    let config = BuildConfig {
        cache_path: Some(".ripple/modules.cache".into()),
        ..BuildConfig::default()
    };

    let first = build_dir(dir.path(), &config).unwrap();
    let cache_file = dir.path().join(".ripple/modules.cache");
    assert!(cache_file.is_file());

    let mut cache = ModuleCache::load(&cache_file).unwrap();
    let graph = ModuleGraph::from_dir(dir.path(), &config, Some(&mut cache)).unwrap();
    assert_eq!(graph.cache_hits(), graph.len());

    let second = build_dir(dir.path(), &config).unwrap();
    assert_eq!(first.artifact, second.artifact);

    write(dir.path(), "ui/theme.py", "card = Style(padding=6)\n");
    let mut cache = ModuleCache::load(&cache_file).unwrap();
    let graph = ModuleGraph::from_dir(dir.path(), &config, Some(&mut cache)).unwrap();
    assert_eq!(graph.cache_hits(), graph.len() - 1);
}

#[test]
fn every_broken_module_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    sample_project(dir.path());
    write(dir.path(), "broken_a.py", "def (:\n");
    write(dir.path(), "broken_b.py", "while True:\n    pass\n");

    let err = build_dir(dir.path(), &BuildConfig::default()).unwrap_err();
    let BuildError::Parse(errors) = &err else {
        panic!("expected parse errors, got {err}");
    };
    let modules: Vec<_> = errors.iter().map(|e| e.module.as_str()).collect();
    assert_eq!(modules, vec!["broken_a", "broken_b"]);
}

#[test]
fn server_values_never_reach_the_client() {
    let sources = [
        ("db", "import sqlite3\nSECRET = 'hunter2'\ndef query():\n    return SECRET\n"),
        ("main", "from db import SECRET\n\n@component\ndef App():\n    Text(SECRET)\n\nApp()\n"),
    ];
    let err = compile_sources(&sources, &BuildConfig::default()).unwrap_err();
    let BuildError::Leak(leak) = &err else {
        panic!("expected a server leak, got {err}");
    };
    assert_eq!(leak.symbol, "db.SECRET");
    assert_eq!(leak.module, "main");
    assert_eq!(leak.function, "App");
    assert_eq!(leak.kind, LeakKind::Reference);
}

#[test]
fn captured_server_values_are_leaks() {
    let sources = [
        ("db", "import sqlite3\nSECRET = 'hunter2'\n"),
        (
            "main",
            "import db\n\n@component\ndef App():\n    key = db.SECRET\n    Button('go', on_click=lambda: print_it(key))\n\ndef print_it(value):\n    return value\n\nApp()\n",
        ),
    ];
    let err = compile_sources(&sources, &BuildConfig::default()).unwrap_err();
    assert!(matches!(err, BuildError::Leak(_)), "{err}");
}

#[test]
fn unresolved_names_fail_the_build() {
    let err = compile_source("Text(greeting)\n").unwrap_err();
    let BuildError::Link(link) = &err else {
        panic!("expected a link error, got {err}");
    };
    assert_eq!(link.symbol, "greeting");
    assert!(matches!(link.kind, LinkErrorKind::Unresolved(_)));
    assert_eq!(err.to_string(), "main:1:6: unresolved symbol 'greeting': not defined");

    let err = compile_source("import math\nText(str(math.floor(1.5)))\n").unwrap_err();
    assert!(matches!(err, BuildError::Link(_)), "{err}");
}

#[test]
fn corrupted_artifacts_are_rejected() {
    let output = compile_source("count = Signal(0)\ncount.value += 1\n").unwrap();
    assert_eq!(&output.artifact[..4], &MAGIC[..]);
    assert!(Program::load(&output.artifact).is_ok());

    let mut bytes = output.artifact.clone();
    bytes[4] = 9;
    assert!(matches!(Program::load(&bytes), Err(ArtifactError::UnsupportedVersion(9))));

    let truncated = &output.artifact[..output.artifact.len() - 2];
    assert!(Program::load(truncated).is_err());
}

#[test]
fn duplicate_module_names_fail_the_build() {
    let sources = [("main", "Text('a')\n"), ("main", "Text('b')\n")];
    let err = compile_sources(&sources, &BuildConfig::default()).unwrap_err();
    assert!(matches!(err, BuildError::Graph(_)), "{err}");
    assert_eq!(err.to_string(), "module 'main' is defined twice");
}
