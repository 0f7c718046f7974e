//! Build script to compile the GLSL shaders to SPIR-V.
//!
//! Every source in `shaders/` is written to `$OUT_DIR/<source name>.spv`.

use shaderc::{CompileOptions, Compiler, ShaderKind};
use std::env;
use std::fs;
use std::path::Path;

const SHADERS: [(&str, ShaderKind); 6] = [
    ("image.comp", ShaderKind::Compute),
    ("particles.comp", ShaderKind::Compute),
    ("shadow.vert", ShaderKind::Vertex),
    ("shadow.tesc", ShaderKind::TessControl),
    ("shadow.tese", ShaderKind::TessEvaluation),
    ("shadow.frag", ShaderKind::Fragment),
];

fn main() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR is set by cargo");
    let shader_dir = Path::new("shaders");

    println!("cargo:rerun-if-changed=shaders/");

    let compiler = Compiler::new().expect("Failed to create shader compiler");
    let mut options = CompileOptions::new().expect("Failed to create compile options");
    options.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_3 as u32,
    );
    options.set_target_spirv(shaderc::SpirvVersion::V1_6);
    options.set_optimization_level(shaderc::OptimizationLevel::Performance);

    for (name, kind) in SHADERS {
        compile_shader(
            &compiler,
            &options,
            &shader_dir.join(name),
            &Path::new(&out_dir).join(format!("{name}.spv")),
            kind,
        );
    }
}

fn compile_shader(
    compiler: &Compiler,
    options: &CompileOptions,
    input: &Path,
    output: &Path,
    kind: ShaderKind,
) {
    let source = fs::read_to_string(input)
        .unwrap_or_else(|e| panic!("Failed to read shader {}: {e}", input.display()));
    let file_name = input.file_name().and_then(|n| n.to_str()).unwrap_or("shader");

    let result = compiler
        .compile_into_spirv(&source, kind, file_name, "main", Some(options))
        .unwrap_or_else(|e| panic!("Failed to compile shader {}: {e}", input.display()));

    if result.get_num_warnings() > 0 {
        println!(
            "cargo:warning=Shader warnings in {}: {}",
            input.display(),
            result.get_warning_messages()
        );
    }

    fs::write(output, bytemuck::cast_slice::<u32, u8>(result.as_binary()))
        .unwrap_or_else(|e| panic!("Failed to write shader {}: {e}", output.display()));
}
