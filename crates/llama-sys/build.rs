use std::env;
use std::path::{Path, PathBuf};

fn main() {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();

    // Source tree: `LLAMA_CPP_DIR` wins, otherwise the git submodule at
    // `vendor/llama.cpp` in the workspace root.
    let llama_cpp_dir = env::var("LLAMA_CPP_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| manifest_dir.join("../../vendor/llama.cpp"));
    println!("cargo:rerun-if-env-changed=LLAMA_CPP_DIR");

    // ── Determine build mode ──────────────────────────────────────────
    //
    // Mode A (prebuilt): `LLAMA_PREBUILT_DIR` points at an install
    //   prefix with `lib/` (or `lib64/`) and `include/`. CMake is skipped;
    //   only linking + bindgen run.
    //
    // Mode B (CMake, default): build the static libraries from the
    //   source tree.
    let (lib_dir, include_dir) = match env::var("LLAMA_PREBUILT_DIR") {
        Ok(prebuilt) => prebuilt_layout(Path::new(&prebuilt)),
        Err(_) => build_from_source(&llama_cpp_dir, &target_os),
    };

    link_libraries(&lib_dir, &target_os);
    generate_bindings(&include_dir, &llama_cpp_dir);
}

fn lib_subdir(prefix: &Path) -> PathBuf {
    if prefix.join("lib64").exists() {
        prefix.join("lib64")
    } else {
        prefix.join("lib")
    }
}

fn prebuilt_layout(prefix: &Path) -> (PathBuf, PathBuf) {
    assert!(
        prefix.exists(),
        "LLAMA_PREBUILT_DIR={} does not exist",
        prefix.display()
    );
    println!(
        "cargo:warning=Using prebuilt llama.cpp from {}",
        prefix.display()
    );
    println!("cargo:rerun-if-env-changed=LLAMA_PREBUILT_DIR");
    (lib_subdir(prefix), prefix.join("include"))
}

fn build_from_source(src: &Path, target_os: &str) -> (PathBuf, PathBuf) {
    assert!(
        src.join("CMakeLists.txt").exists(),
        "llama.cpp source not found at {}. \
         Run `git submodule update --init --recursive` or set LLAMA_CPP_DIR.",
        src.display()
    );

    let mut cfg = cmake::Config::new(src);
    cfg.define("BUILD_SHARED_LIBS", "OFF")
        .define("LLAMA_BUILD_SERVER", "OFF")
        .define("LLAMA_BUILD_TESTS", "OFF")
        .define("LLAMA_BUILD_EXAMPLES", "OFF")
        .define("LLAMA_BUILD_TOOLS", "OFF")
        .define("LLAMA_BUILD_COMMON", "OFF")
        .define("LLAMA_CURL", "OFF");

    if env::var("CARGO_FEATURE_CUDA").is_ok() {
        cfg.define("GGML_CUDA", "ON");
    }
    if env::var("CARGO_FEATURE_VULKAN").is_ok() {
        cfg.define("GGML_VULKAN", "ON");
    }
    if env::var("CARGO_FEATURE_ROCM").is_ok() {
        let rocm = env::var("ROCM_PATH").unwrap_or_else(|_| "/opt/rocm".into());
        cfg.define("GGML_HIP", "ON")
            .define("CMAKE_HIP_COMPILER_ROCM_ROOT", &rocm)
            .define("CMAKE_HIP_FLAGS", format!("--rocm-path={rocm}"));
        if let Ok(targets) = env::var("AMDGPU_TARGETS") {
            cfg.define("AMDGPU_TARGETS", &targets);
        }
    }
    if target_os == "macos" {
        cfg.define("GGML_METAL", "ON");
    }

    let dst = cfg.build();
    println!("cargo:rerun-if-changed={}", src.join("include/llama.h").display());
    (lib_subdir(&dst), dst.join("include"))
}

fn link_libraries(lib_dir: &Path, target_os: &str) {
    println!("cargo:rustc-link-search=native={}", lib_dir.display());
    println!("cargo:rustc-link-lib=static=llama");

    for name in &["ggml", "ggml-base", "ggml-cpu"] {
        if lib_dir.join(format!("lib{name}.a")).exists() {
            println!("cargo:rustc-link-lib=static={name}");
        }
    }

    if env::var("CARGO_FEATURE_CUDA").is_ok() && lib_dir.join("libggml-cuda.a").exists() {
        println!("cargo:rustc-link-lib=static=ggml-cuda");
        for lib in &["cuda", "cublas", "culibos", "cudart"] {
            println!("cargo:rustc-link-lib={lib}");
        }
    }
    if env::var("CARGO_FEATURE_VULKAN").is_ok() && lib_dir.join("libggml-vulkan.a").exists() {
        println!("cargo:rustc-link-lib=static=ggml-vulkan");
        println!("cargo:rustc-link-lib=vulkan");
    }
    if env::var("CARGO_FEATURE_ROCM").is_ok() && lib_dir.join("libggml-hip.a").exists() {
        println!("cargo:rustc-link-lib=static=ggml-hip");
        let rocm = env::var("ROCM_PATH").unwrap_or_else(|_| "/opt/rocm".into());
        println!("cargo:rustc-link-search=native={rocm}/lib");
        for lib in &[
            "amdhip64",
            "hipblas",
            "hiprtc",
            "rocblas",
            "hsa-runtime64",
            "amd_comgr",
        ] {
            println!("cargo:rustc-link-lib={lib}");
        }
    }

    match target_os {
        "linux" => {
            println!("cargo:rustc-link-lib=stdc++");
            println!("cargo:rustc-link-lib=m");
            println!("cargo:rustc-link-lib=pthread");
            println!("cargo:rustc-link-lib=gomp"); // OpenMP (ggml-cpu)
        }
        "macos" => {
            if lib_dir.join("libggml-metal.a").exists() {
                println!("cargo:rustc-link-lib=static=ggml-metal");
            }
            if lib_dir.join("libggml-blas.a").exists() {
                println!("cargo:rustc-link-lib=static=ggml-blas");
            }
            for fw in &["Accelerate", "Metal", "MetalKit", "Foundation"] {
                println!("cargo:rustc-link-lib=framework={fw}");
            }
            println!("cargo:rustc-link-lib=c++");
        }
        "windows" => {
            println!("cargo:rustc-link-lib=msvcrt");
        }
        _ => {}
    }
}

fn generate_bindings(include_dir: &Path, src: &Path) {
    let mut builder = bindgen::Builder::default()
        .header("wrapper.h")
        .clang_arg(format!("-I{}", include_dir.display()));

    // ggml headers live in a separate directory in the source tree.
    let ggml_include = src.join("ggml/include");
    if ggml_include.exists() {
        builder = builder.clang_arg(format!("-I{}", ggml_include.display()));
    }

    let bindings = builder
        .allowlist_function("llama_.*")
        .allowlist_function("ggml_.*")
        .allowlist_type("llama_.*")
        .allowlist_type("ggml_.*")
        .allowlist_var("LLAMA_.*")
        .allowlist_var("GGML_.*")
        .derive_default(true)
        .size_t_is_usize(true)
        .generate()
        .expect("Failed to generate bindings");

    let out = PathBuf::from(env::var("OUT_DIR").unwrap());
    bindings
        .write_to_file(out.join("bindings.rs"))
        .expect("Failed to write bindings");

    println!("cargo:rerun-if-changed=wrapper.h");
}
