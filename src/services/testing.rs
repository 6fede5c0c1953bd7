//! 测试辅助：用 shell 脚本模拟 Python 解释器
//!
//! - `-m venv <path>`：创建 `<path>/bin/python`（复制自身）
//! - `-m pip install ...`：逐个回显参数；`broken` 失败，`hang` 挂起，`slow` 延迟一秒

use std::path::{Path, PathBuf};
use std::process::Command;

const FAKE_PYTHON: &str = r#"#!/bin/sh
if [ "$1" = "-m" ] && [ "$2" = "venv" ]; then
    mkdir -p "$3/bin" || exit 1
    cp "$0" "$3/bin/python" || exit 1
    echo "created virtual environment in $3"
    exit 0
fi
if [ "$1" = "-m" ] && [ "$2" = "pip" ]; then
    shift 3
    for arg in "$@"; do
        echo "arg $arg"
    done
    case " $* " in
        *" broken "*) echo "ERROR: No matching distribution found for broken" >&2; exit 1 ;;
        *" hang "*) echo "waiting"; sleep 30 ;;
        *" slow "*) sleep 1 ;;
    esac
    echo "Successfully installed $*"
    exit 0
fi
echo "unsupported invocation: $*" >&2
exit 2
"#;

/// 在 `<root>/python-<version>/bin/python3` 安装假解释器
pub(crate) fn install_fake_runtime(root: &Path, version: &str) -> PathBuf {
    install_runtime_script(root, version, FAKE_PYTHON)
}

/// 安装任意脚本作为解释器
///
/// 可执行文件由子进程复制生成，本进程从不持有它的写句柄，
/// 避免并行测试 fork 时继承写句柄导致 ETXTBSY
pub(crate) fn install_runtime_script(root: &Path, version: &str, script: &str) -> PathBuf {
    let bin = root.join(format!("python-{}", version)).join("bin");
    std::fs::create_dir_all(&bin).unwrap();

    let source = root.join(format!("fake_python_{}.sh", version));
    std::fs::write(&source, script).unwrap();

    let exe = bin.join("python3");
    let status = Command::new("sh")
        .arg("-c")
        .arg("cp \"$1\" \"$2\" && chmod 755 \"$2\"")
        .arg("sh")
        .arg(&source)
        .arg(&exe)
        .status()
        .unwrap();
    assert!(status.success());
    exe
}
