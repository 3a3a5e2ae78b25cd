//! End-to-end engine scenarios against the scripted toolchain: clean runs,
//! retagging, module upgrade and pin-back, inline substitution, dependency
//! porting, and the determinism guarantees.

mod support;

use support::*;

#[test]
fn clean_workspace_emits_nothing() {
    let root = create_temp_dir("wharf_engine");
    let app_dir = root.join("app");
    write_file(&app_dir, "main.go", "package main\n\nfunc main() {}\n");

    let mut tool = ScriptedToolchain::new();
    tool.push_list(&[meta_entry(
        &app_dir,
        "example.com/app",
        "main",
        main_module("example.com/app", &root),
        &["main.go"],
        &[],
        true,
    )]);
    tool.push_check_ok("example.com/app", &["main.go"]);

    let mut ctx = scripted_context(&root, tool);
    let out = ctx.run(&["example.com/app".to_string()]).expect("run");

    assert!(out.modules.is_empty());
    assert!(out.packages.is_empty());
    rm_rf(&root);
}

#[test]
fn retag_selects_the_linux_candidate() {
    let root = create_temp_dir("wharf_engine");
    let lib_dir = root.join("lib");
    write_file(&lib_dir, "base.go", "package lib\n");
    write_file(
        &lib_dir,
        "fds_default.go",
        "//go:build !linux\n\npackage lib\n",
    );
    write_file(&lib_dir, "fds_linux.go", "//go:build linux\n\npackage lib\n");

    let mut tool = ScriptedToolchain::new();
    let mut entry = meta_entry(
        &lib_dir,
        "example.com/lib",
        "lib",
        main_module("example.com/lib", &root),
        &["base.go", "fds_default.go"],
        &[],
        true,
    );
    entry["IgnoredGoFiles"] = serde_json::json!(["fds_linux.go"]);
    tool.push_list(&[entry]);

    // The default candidate trips over a symbol only the linux file defines.
    tool.push_check_errors(
        "example.com/lib",
        &["base.go", "fds_default.go"],
        &[("fds_default.go", "undefined: sockOpts")],
    );
    tool.push_check_ok("example.com/lib", &["base.go", "fds_linux.go"]);

    let mut ctx = scripted_context(&root, tool);
    let out = ctx.run(&["example.com/lib".to_string()]).expect("run");

    assert!(out.modules.is_empty());
    assert_eq!(out.packages.len(), 1);
    let patch = &out.packages[0];
    assert_eq!(patch.path, "example.com/lib");
    assert_eq!(patch.tags, vec!["linux"]);
    assert_eq!(patch.files.len(), 2);
    assert_eq!(patch.files[0].name, "fds_linux.go");
    assert!(patch.files[0].build);
    assert_eq!(patch.files[1].name, "fds_default.go");
    assert!(!patch.files[1].build);
    rm_rf(&root);
}

fn sys_fixture(root: &std::path::Path) -> (std::path::PathBuf, std::path::PathBuf, std::path::PathBuf) {
    let app_dir = root.join("app");
    write_file(
        &app_dir,
        "main.go",
        "package main\n\nimport \"golang.org/x/sys/unix\"\n",
    );
    let sysv1 = root.join("sysv1/unix");
    write_file(&sysv1, "unix.go", "package unix\n");
    let sysv2 = root.join("sysv2/unix");
    write_file(&sysv2, "unix.go", "package unix\n");
    (app_dir, sysv1, sysv2)
}

fn sys_entries(
    root: &std::path::Path,
    app_dir: &std::path::Path,
    sys_dir: &std::path::Path,
    replaced: Option<(&str, &std::path::Path)>,
) -> Vec<serde_json::Value> {
    let mut module = dep_module("golang.org/x/sys", "v0.1.0", sys_dir.parent().unwrap());
    if let Some((version, dir)) = replaced {
        module["Replace"] = serde_json::json!({
            "Path": "golang.org/x/sys",
            "Version": version,
            "Dir": dir.parent().unwrap().to_string_lossy(),
        });
    }
    vec![
        meta_entry(
            app_dir,
            "example.com/app",
            "main",
            main_module("example.com/app", root),
            &["main.go"],
            &["golang.org/x/sys/unix"],
            true,
        ),
        meta_entry(
            sys_dir,
            "golang.org/x/sys/unix",
            "unix",
            module,
            &["unix.go"],
            &[],
            false,
        ),
    ]
}

#[test]
fn module_upgrade_pins_and_reloads_once() {
    let root = create_temp_dir("wharf_engine");
    let (app_dir, sysv1, sysv2) = sys_fixture(&root);

    let mut tool = ScriptedToolchain::new();
    tool.push_list(&sys_entries(&root, &app_dir, &sysv1, None));
    tool.push_list(&sys_entries(
        &root,
        &app_dir,
        &sysv2,
        Some(("v0.2.0", sysv2.as_path())),
    ));
    tool.set_update("golang.org/x/sys", "v0.2.0");

    // v0.1.0 is broken on the target, v0.2.0 checks clean.
    tool.push_check_errors(
        "golang.org/x/sys/unix",
        &["unix.go"],
        &[("unix.go", "undefined: zosDirent")],
    );
    tool.push_check_ok("golang.org/x/sys/unix", &["unix.go"]);
    tool.push_check_ok("example.com/app", &["main.go"]);

    let log = tool.log.clone();
    let mut ctx = scripted_context(&root, tool);
    let out = ctx.run(&["example.com/app".to_string()]).expect("run");

    assert_eq!(out.modules.len(), 1);
    let pin = &out.modules[0];
    assert_eq!(pin.path, "golang.org/x/sys");
    assert_eq!(pin.version, "v0.1.0");
    assert_eq!(pin.pinned, "v0.2.0");
    assert!(!pin.imported);
    assert!(out.packages.is_empty());

    let log = log.lock().unwrap().clone();
    let replaces: Vec<&String> = log.iter().filter(|l| l.starts_with("replace ")).collect();
    assert_eq!(replaces, vec!["replace golang.org/x/sys@v0.2.0"]);
    assert_eq!(log.iter().filter(|l| l.starts_with("list")).count(), 2);
    rm_rf(&root);
}

#[test]
fn failed_upgrade_pins_back_to_the_original() {
    let root = create_temp_dir("wharf_engine");
    let (app_dir, sysv1, sysv2) = sys_fixture(&root);

    let mut tool = ScriptedToolchain::new();
    tool.push_list(&sys_entries(&root, &app_dir, &sysv1, None));
    tool.push_list(&sys_entries(
        &root,
        &app_dir,
        &sysv2,
        Some(("v0.2.0", sysv2.as_path())),
    ));
    tool.push_list(&sys_entries(
        &root,
        &app_dir,
        &sysv1,
        Some(("v0.1.0", sysv1.as_path())),
    ));
    tool.set_update("golang.org/x/sys", "v0.2.0");

    // Broken at both versions.
    tool.push_check_errors(
        "golang.org/x/sys/unix",
        &["unix.go"],
        &[("unix.go", "undefined: zosDirent")],
    );
    tool.push_check_errors(
        "example.com/app",
        &["main.go"],
        &[("main.go", "undefined: unix.Dirent")],
    );

    let log = tool.log.clone();
    let mut ctx = scripted_context(&root, tool);
    let out = ctx.run(&["example.com/app".to_string()]).expect("run");

    assert_eq!(out.modules.len(), 1);
    let pin = &out.modules[0];
    assert_eq!(pin.version, "v0.1.0");
    assert_eq!(pin.pinned, "v0.1.0");

    // Both the dependency and its importer end up unportable.
    assert_eq!(out.packages.len(), 2);
    assert_eq!(out.packages[0].path, "example.com/app");
    assert!(out.packages[0].error.contains("cannot patch"), "{}", out.packages[0].error);
    assert_eq!(out.packages[1].path, "golang.org/x/sys/unix");
    assert!(!out.packages[1].error.is_empty());

    // Pin transitions: upgrade, then back to the original. Never a third.
    let log = log.lock().unwrap().clone();
    let replaces: Vec<&String> = log.iter().filter(|l| l.starts_with("replace ")).collect();
    assert_eq!(
        replaces,
        vec!["replace golang.org/x/sys@v0.2.0", "replace golang.org/x/sys@v0.1.0"]
    );
    rm_rf(&root);
}

#[test]
fn inline_substitution_synthesizes_a_derived_file() {
    let root = create_temp_dir("wharf_engine");
    let app_dir = root.join("app");
    write_file(
        &app_dir,
        "foo.go",
        "package main\n\nimport \"syscall\"\n\nfunc bad() error {\n\treturn syscall.EBADF\n}\n",
    );
    let syscall_dir = root.join("goroot/syscall");
    write_file(&syscall_dir, "syscall.go", "package syscall\n");

    let mut tool = ScriptedToolchain::new();
    let mut syscall_entry = meta_entry(
        &syscall_dir,
        "syscall",
        "syscall",
        serde_json::Value::Null,
        &["syscall.go"],
        &[],
        false,
    );
    syscall_entry["Goroot"] = serde_json::json!(true);
    syscall_entry["Standard"] = serde_json::json!(true);
    tool.push_list(&[
        meta_entry(
            &app_dir,
            "example.com/app",
            "main",
            main_module("example.com/app", &root),
            &["foo.go"],
            &["syscall"],
            true,
        ),
        syscall_entry,
    ]);

    tool.push_check_ok("syscall", &["syscall.go"]);
    tool.push_check_errors(
        "example.com/app",
        &["foo.go"],
        &[("foo.go", "undefined: syscall.EBADF")],
    );
    tool.push_check_ok("example.com/app", &["foo_zos.go"]);

    let mut ctx = scripted_context(&root, tool);
    let out = ctx.run(&["example.com/app".to_string()]).expect("run");

    assert!(out.modules.is_empty());
    assert_eq!(out.packages.len(), 1);
    let patch = &out.packages[0];
    assert_eq!(patch.tags, vec!["zos"]);
    assert_eq!(patch.files.len(), 2);

    let derived = &patch.files[0];
    assert_eq!(derived.name, "foo_zos.go");
    assert!(derived.build);
    assert_eq!(derived.base_file, "foo.go");
    assert_eq!(derived.symbols.len(), 1);
    assert_eq!(derived.symbols[0].original, "syscall.EBADF");
    assert_eq!(derived.symbols[0].new, "0x09");

    let excluded = &patch.files[1];
    assert_eq!(excluded.name, "foo.go");
    assert!(!excluded.build);

    // The derived copy in the cache carries the replacement.
    let cached = root.join("cache/example.com/app/foo.go");
    let text = std::fs::read_to_string(&cached).expect("derived file in cache");
    assert!(text.contains("return 0x09"), "{text}");
    assert!(!text.contains("syscall.EBADF"), "{text}");
    rm_rf(&root);
}

#[test]
fn parent_errors_drive_dependency_retagging() {
    let root = create_temp_dir("wharf_engine");
    let app_dir = root.join("app");
    write_file(
        &app_dir,
        "main.go",
        "package main\n\nimport \"example.com/app/internal/fds\"\n",
    );
    let fds_dir = root.join("fds");
    write_file(
        &fds_dir,
        "fds_linux.go",
        "//go:build linux\n\npackage fds\n",
    );

    let mut tool = ScriptedToolchain::new();
    let mut fds_entry = meta_entry(
        &fds_dir,
        "example.com/app/internal/fds",
        "",
        main_module("example.com/app", &root),
        &[],
        &[],
        false,
    );
    fds_entry["IgnoredGoFiles"] = serde_json::json!(["fds_linux.go"]);
    fds_entry["Error"] = serde_json::json!({
        "Err": format!("build constraints exclude all Go files in {}", fds_dir.display()),
    });
    tool.push_list(&[
        meta_entry(
            &app_dir,
            "example.com/app",
            "main",
            main_module("example.com/app", &root),
            &["main.go"],
            &["example.com/app/internal/fds"],
            true,
        ),
        fds_entry,
    ]);

    // The importer fails until the dependency's linux candidate is chosen.
    tool.push_check_errors(
        "example.com/app",
        &["main.go"],
        &[("main.go", "undefined: fds.Listen")],
    );
    tool.push_check_ok("example.com/app", &["main.go"]);
    tool.push_check_ok("example.com/app/internal/fds", &["fds_linux.go"]);

    let log = tool.log.clone();
    let mut ctx = scripted_context(&root, tool);
    let out = ctx.run(&["example.com/app".to_string()]).expect("run");

    assert_eq!(out.packages.len(), 1);
    let patch = &out.packages[0];
    assert_eq!(patch.path, "example.com/app/internal/fds");
    assert_eq!(patch.tags, vec!["linux"]);
    assert_eq!(patch.files.len(), 1);
    assert_eq!(patch.files[0].name, "fds_linux.go");
    assert!(patch.files[0].build);

    // A package with no active files never reaches the checker directly.
    let log = log.lock().unwrap().clone();
    assert!(
        !log.iter().any(|l| l.starts_with("check example.com/app/internal/fds []")),
        "{log:?}"
    );
    rm_rf(&root);
}

#[test]
fn unclassifiable_errors_exhaust_the_package() {
    let root = create_temp_dir("wharf_engine");
    let app_dir = root.join("app");
    write_file(&app_dir, "main.go", "package main\n");

    let mut tool = ScriptedToolchain::new();
    tool.push_list(&[meta_entry(
        &app_dir,
        "example.com/app",
        "main",
        main_module("example.com/app", &root),
        &["main.go"],
        &[],
        true,
    )]);
    tool.push_check_errors(
        "example.com/app",
        &["main.go"],
        &[("main.go", "invalid operation: mismatched types int and string")],
    );

    let mut ctx = scripted_context(&root, tool);
    let out = ctx.run(&["example.com/app".to_string()]).expect("run");

    assert_eq!(out.packages.len(), 1);
    assert!(
        out.packages[0].error.contains("unknown type error"),
        "{}",
        out.packages[0].error
    );
    assert!(out.packages[0].files.is_empty());
    rm_rf(&root);
}

#[test]
fn cycles_are_fatal_with_a_traceback() {
    let root = create_temp_dir("wharf_engine");
    let a_dir = root.join("a");
    let b_dir = root.join("b");
    write_file(&a_dir, "a.go", "package a\n\nimport \"example.com/m/b\"\n");
    write_file(&b_dir, "b.go", "package b\n\nimport \"example.com/m/a\"\n");

    let mut tool = ScriptedToolchain::new();
    tool.push_list(&[
        meta_entry(
            &a_dir,
            "example.com/m/a",
            "a",
            main_module("example.com/m", &root),
            &["a.go"],
            &["example.com/m/b"],
            true,
        ),
        meta_entry(
            &b_dir,
            "example.com/m/b",
            "b",
            main_module("example.com/m", &root),
            &["b.go"],
            &["example.com/m/a"],
            false,
        ),
    ]);

    let mut ctx = scripted_context(&root, tool);
    let err = ctx
        .run(&["example.com/m/a".to_string()])
        .expect_err("cycles must abort the run");
    let message = format!("{err:#}");
    assert!(message.contains("import cycle detected"), "{message}");
    assert!(message.contains("--- SEEN HERE BEFORE"), "{message}");
    rm_rf(&root);
}

#[test]
fn identical_runs_emit_identical_json() {
    let root = create_temp_dir("wharf_engine");
    let lib_dir = root.join("lib");
    write_file(&lib_dir, "base.go", "package lib\n");
    write_file(
        &lib_dir,
        "fds_default.go",
        "//go:build !linux\n\npackage lib\n",
    );
    write_file(&lib_dir, "fds_linux.go", "//go:build linux\n\npackage lib\n");

    let run_once = || {
        let mut tool = ScriptedToolchain::new();
        let mut entry = meta_entry(
            &lib_dir,
            "example.com/lib",
            "lib",
            main_module("example.com/lib", &root),
            &["base.go", "fds_default.go"],
            &[],
            true,
        );
        entry["IgnoredGoFiles"] = serde_json::json!(["fds_linux.go"]);
        tool.push_list(&[entry]);
        tool.push_check_errors(
            "example.com/lib",
            &["base.go", "fds_default.go"],
            &[("fds_default.go", "undefined: sockOpts")],
        );
        tool.push_check_ok("example.com/lib", &["base.go", "fds_linux.go"]);

        let mut ctx = scripted_context(&root, tool);
        ctx.run(&["example.com/lib".to_string()]).expect("run").to_json()
    };

    let first = run_once();
    let second = run_once();
    assert_eq!(first, second);
    rm_rf(&root);
}
