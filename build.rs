// Build script to compile GLSL shaders to SPIR-V

use std::path::Path;
use std::process::Command;

const SHADERS: [&str; 3] = ["flat", "image", "sdf"];

fn main() {
    println!("cargo:rerun-if-changed=shaders/");

    // Compile shaders using glslc (part of Vulkan SDK)
    for name in SHADERS {
        for stage in ["vert", "frag"] {
            let input = format!("shaders/{name}.{stage}");
            let output = format!("shaders/{name}.{stage}.spv");
            compile_shader(&input, &output);
        }
    }
}

fn compile_shader(input: &str, output: &str) {
    let input_path = Path::new(input);
    let output_path = Path::new(output);

    let result = Command::new("glslc")
        .arg("--target-env=vulkan1.2")
        .arg(input_path)
        .arg("-o")
        .arg(output_path)
        .status();

    match result {
        Ok(status) if status.success() => {}
        Ok(status) => {
            println!(
                "cargo:warning=Failed to compile {}: exit code {:?}",
                input,
                status.code()
            );
        }
        Err(e) => {
            println!("cargo:warning=glslc not found ({e}); {input} was not compiled");
            eprintln!("Install Vulkan SDK or compile manually:");
            eprintln!("  glslc --target-env=vulkan1.2 {} -o {}", input, output);
        }
    }
}
