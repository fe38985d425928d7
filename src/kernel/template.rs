//! WGSL rendering of a [`ProgramModel`].
//!
//! Each program is a compute shader with one invocation per output point.
//! Inputs are sampled from `Rgba32Uint` textures through an attribute table,
//! and the captured output registers are written to a storage buffer in the
//! interleaved layout of the result buffer.

use crate::format::{Base, SimpleFormat};

use super::model::{suffix, Identity, ProgramModel, ReadFunction};

/// Invocations per workgroup.
pub const WORKGROUP_SIZE: u32 = 64;

/// Largest workgroup count along one dispatch dimension.
pub const MAX_GROUPS_PER_DIMENSION: u32 = 65535;

/// Workgroup grid covering `points` invocations.
pub fn dispatch_grid(points: u32) -> (u32, u32, u32) {
    let groups = points.div_ceil(WORKGROUP_SIZE);
    if groups <= MAX_GROUPS_PER_DIMENSION {
        (groups, 1, 1)
    } else {
        (
            MAX_GROUPS_PER_DIMENSION,
            groups.div_ceil(MAX_GROUPS_PER_DIMENSION),
            1,
        )
    }
}

const PRELUDE: &str = "\
struct glc_Params {
    seed: vec4u,
    part: vec2i,
    limit: i32,
    points: u32,
}

struct glc_Attrib {
    repeat: i32,
    offset: i32,
    count: i32,
    pad: i32,
}
";

const RANDOM: &str = "\
var<private> glc_rng: vec4u;

fn glc_taus(z: u32, s1: u32, s2: u32, s3: u32, m: u32) -> u32 {
    let b = ((z << s1) ^ z) >> s2;
    return ((z & m) << s3) ^ b;
}

fn random() -> f32 {
    glc_rng.x = glc_taus(glc_rng.x, 13u, 19u, 12u, 0xFFFFFFFEu);
    glc_rng.y = glc_taus(glc_rng.y, 2u, 25u, 4u, 0xFFFFFFF8u);
    glc_rng.z = glc_taus(glc_rng.z, 3u, 11u, 17u, 0xFFFFFFF0u);
    glc_rng.w = 1664525u * glc_rng.w + 1013904223u;
    let r = glc_rng.x ^ glc_rng.y ^ glc_rng.z ^ glc_rng.w;
    return min(f32(r) * 2.3283064e-10, 0.99999994);
}
";

/// Render the program, capturing the registers at indices `captured`.
pub fn render(model: &ProgramModel, captured: &[usize]) -> String {
    let mut out = String::with_capacity(8 * 1024);
    out.push_str(PRELUDE);
    out.push('\n');
    bindings(&mut out, model);
    out.push('\n');
    out.push_str(RANDOM);
    identities(&mut out, &model.identities);
    for (slot, used) in model.samplers.iter().enumerate() {
        if *used {
            sampler_helpers(&mut out, slot);
        }
    }
    for read in &model.read_functions {
        read_function(&mut out, read);
    }
    registers(&mut out, model);
    out.push('\n');
    out.push_str(model.user_code.trim());
    out.push_str("\n\n");
    if !model.helpers.trim().is_empty() {
        out.push_str(model.helpers.trim());
        out.push_str("\n\n");
    }
    main(&mut out, model, captured);
    out
}

fn bindings(out: &mut String, model: &ProgramModel) {
    out.push_str("@group(0) @binding(0) var<uniform> glc_params: glc_Params;\n");
    if !model.read_functions.is_empty() {
        out.push_str("@group(0) @binding(1) var<storage, read> glc_attribs: array<glc_Attrib>;\n");
    }
    for (slot, used) in model.samplers.iter().enumerate() {
        if *used {
            out.push_str(&format!(
                "@group(0) @binding({}) var glc_sampler{slot}: texture_2d<u32>;\n",
                slot + 2
            ));
        }
    }
    out.push_str("@group(0) @binding(5) var<storage, read_write> glc_capture: array<u32>;\n");
}

fn identities(out: &mut String, identities: &[Identity]) {
    if identities.is_empty() {
        return;
    }
    out.push('\n');
    for id in identities {
        let name = format!("identity{}", suffix(id.key.as_deref()));
        let ty = id.format.wgsl();
        out.push_str(&format!("const {name}: {ty} = {};\n", id.value));
        for batch in [2u8, 4] {
            let Some(wide) = id.format.with_components(id.format.components * batch) else {
                continue;
            };
            let args = vec![name.as_str(); batch as usize].join(", ");
            out.push_str(&format!(
                "const {}: {} = {}({args});\n",
                batched_identity(id.key.as_deref(), batch),
                wide.wgsl(),
                wide.wgsl()
            ));
        }
    }
}

fn batched_identity(key: Option<&str>, batch: u8) -> String {
    match batch {
        1 => format!("identity{}", suffix(key)),
        n => format!("glc_identity{}_{n}", suffix(key)),
    }
}

fn sampler_helpers(out: &mut String, slot: usize) {
    out.push_str(&format!(
        "
fn glc_fetch{slot}(t: i32) -> vec4u {{
    let w = i32(textureDimensions(glc_sampler{slot}).x);
    return textureLoad(glc_sampler{slot}, vec2i(t % w, t / w), 0);
}}

fn glc_gather{slot}(t: i32, w: i32) -> vec4u {{
    let tt = t + w / 4;
    let o = w % 4;
    let a = glc_fetch{slot}(tt);
    let b = glc_fetch{slot}(tt + 1);
    var q = array<u32, 8>(a.x, a.y, a.z, a.w, b.x, b.y, b.z, b.w);
    return vec4u(q[o], q[o + 1], q[o + 2], q[o + 3]);
}}
"
    ));
}

fn read_function(out: &mut String, read: &ReadFunction) {
    let key = read.key.as_deref();
    let request = read.request;
    let ty = request.wgsl();
    let batch = read.batch_size;
    let words = request.components;
    let identity = format!("identity{}", suffix(key));

    let swizzle = match words {
        1 => ".x",
        2 => ".xy",
        3 => ".xyz",
        _ => "",
    };
    let raw = format!("glc_gather{}(t, {words} * j){swizzle}", read.slot.index());
    let value = match request.base {
        Base::Float | Base::Int => format!("bitcast<{ty}>({raw})"),
        Base::Uint => raw,
    };

    out.push_str(&format!(
        "\nfn {}(i: i32) -> {ty} {{\n    let a = glc_attribs[{}];\n",
        read.name(),
        read.attrib_index
    ));
    out.push_str(&format!(
        "    if (i < 0 || i >= a.count) {{\n        return {};\n    }}\n",
        batched_identity(key, batch)
    ));
    if batch > 1 {
        out.push_str(&format!("    let over = i + {batch} - a.count;\n"));
    }
    out.push_str(&format!("    let j = (i % 4) / {batch};\n"));
    out.push_str("    let t = (i / 4) * (a.repeat / 4) + a.offset / 4;\n");

    let fill = partial_fill(read.native, request, &identity);
    if fill.is_empty() {
        out.push_str(&format!("    return {value};\n}}\n"));
    } else {
        out.push_str(&format!("    var v = {value};\n{fill}    return v;\n}}\n"));
    }
}

/// Replace components past the end of the attribute with the identity.
fn partial_fill(native: SimpleFormat, request: SimpleFormat, identity: &str) -> String {
    match (native.components, request.components) {
        (1, 2) => format!("    if (over > 0) {{\n        v.y = {identity};\n    }}\n"),
        (2, 4) => format!(
            "    if (over > 0) {{\n        v = {}(v.xy, {identity});\n    }}\n",
            request.wgsl()
        ),
        (1, 4) => format!(
            "    if (over > 0) {{\n        v.w = {identity};\n    }}\n\
             \x20   if (over >= 2) {{\n        v.z = {identity};\n    }}\n\
             \x20   if (over >= 3) {{\n        v.y = {identity};\n    }}\n"
        ),
        _ => String::new(),
    }
}

fn registers(out: &mut String, model: &ProgramModel) {
    out.push('\n');
    for reg in &model.out_registers {
        out.push_str(&format!("var<private> {}: {};\n", reg.var(), reg.format.wgsl()));
    }
    let batch = model.write_batch_size;
    for w in &model.write_functions {
        let k = suffix(w.key.as_deref());
        let ty = w.format.wgsl();
        if batch <= 2 {
            out.push_str(&format!("var<private> glc_write{k}_0: {ty};\n"));
        }
        if batch == 2 {
            out.push_str(&format!("var<private> glc_write{k}_1: {ty};\n"));
        }
    }
    for w in &model.write_functions {
        let k = suffix(w.key.as_deref());
        let ty = w.format.wgsl();
        let params: Vec<String> = (0..batch).map(|n| format!("v{n}: {ty}")).collect();
        out.push_str(&format!("\nfn glc_write{k}({}) {{\n", params.join(", ")));
        for n in 0..batch {
            if batch <= 2 {
                out.push_str(&format!("    glc_write{k}_{n} = v{n};\n"));
            } else {
                let key = w.key.as_deref().map(|k| format!("{k}_")).unwrap_or_default();
                out.push_str(&format!("    glc_out_{key}{n} = v{n};\n"));
            }
        }
        out.push_str("}\n");
    }
}

fn main(out: &mut String, model: &ProgramModel, captured: &[usize]) {
    let m = model.vertex_id_multiplier as usize;
    out.push_str(&format!(
        "@compute @workgroup_size({WORKGROUP_SIZE})
fn glc_main(@builtin(global_invocation_id) gid: vec3u, @builtin(num_workgroups) groups: vec3u) {{
    let vertex = gid.x + gid.y * groups.x * {WORKGROUP_SIZE}u;
    if (vertex >= glc_params.points) {{
        return;
    }}
    glc_rng = vec4u(glc_params.seed.xyz, vertex + 1u);
    let i = i32(vertex) * {m};
"
    ));
    indent(out, &model.main.before);

    let index = |bank: usize| match bank * m / 4 {
        0 => "i".to_string(),
        offset => format!("i + {offset}"),
    };
    let copy = |out: &mut String, register: usize, write: usize| {
        for w in &model.write_functions {
            let key = w.key.as_deref();
            let name = key.map(|k| format!("{k}_")).unwrap_or_default();
            out.push_str(&format!(
                "    glc_out_{name}{register} = glc_write{}_{write};\n",
                suffix(key)
            ));
        }
    };
    match model.write_batch_size {
        1 => {
            for bank in 0..4 {
                indent(out, &model.main.render_call(&index(bank), bank));
                copy(out, bank, 0);
            }
        }
        2 => {
            indent(out, &model.main.render_call(&index(0), 0));
            copy(out, 0, 0);
            copy(out, 1, 1);
            indent(out, &model.main.render_call(&index(2), 2));
            copy(out, 2, 0);
            copy(out, 3, 1);
        }
        _ => indent(out, &model.main.render_call(&index(0), 0)),
    }

    indent(out, &model.main.after);

    let stride = model.stride(captured);
    let mut offset = 0u32;
    for &r in captured {
        let reg = &model.out_registers[r];
        let components = reg.format.components;
        for c in 0..components {
            let element = if components == 1 {
                reg.var()
            } else {
                format!("{}.{}", reg.var(), ["x", "y", "z", "w"][c as usize])
            };
            out.push_str(&format!(
                "    glc_capture[vertex * {stride}u + {offset}u] = bitcast<u32>({element});\n"
            ));
            offset += 1;
        }
    }
    out.push_str("}\n");
}

fn indent(out: &mut String, code: &str) {
    for line in code.lines().filter(|l| !l.trim().is_empty()) {
        out.push_str("    ");
        out.push_str(line.trim_end());
        out.push('\n');
    }
}
