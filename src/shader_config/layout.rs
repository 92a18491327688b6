//! Deterministic layout computation: vertex-type detection, attribute
//! compaction, and std140-like uniform packing (§4.8, P6-P8).

use super::*;
use crate::config::UBO_ALIGNMENT;
use crate::error::{ParseError, ParseErrorKind};
use std::collections::HashMap;

struct ExpectedAttribute {
    name: &'static str,
    attr_type: AttributeType,
}

fn expectation_table(vertex_type: VertexType) -> &'static [ExpectedAttribute] {
    const VERTEX_3D: &[ExpectedAttribute] = &[
        ExpectedAttribute { name: "in_position", attr_type: AttributeType::Vec3 },
        ExpectedAttribute { name: "in_normal", attr_type: AttributeType::Vec3 },
        ExpectedAttribute { name: "in_texcoord", attr_type: AttributeType::Vec2 },
        ExpectedAttribute { name: "in_color", attr_type: AttributeType::Vec4 },
        ExpectedAttribute { name: "in_tangent", attr_type: AttributeType::Vec4 },
    ];
    const VERTEX_2D_TEXT: &[ExpectedAttribute] = &[
        ExpectedAttribute { name: "in_position", attr_type: AttributeType::Vec2 },
        ExpectedAttribute { name: "in_texcoord", attr_type: AttributeType::Vec2 },
        ExpectedAttribute { name: "in_color", attr_type: AttributeType::Vec4 },
    ];
    const VERTEX_2D_PLAIN: &[ExpectedAttribute] = &[
        ExpectedAttribute { name: "in_position", attr_type: AttributeType::Vec2 },
        ExpectedAttribute { name: "in_texcoord", attr_type: AttributeType::Vec2 },
    ];
    match vertex_type {
        VertexType::Vertex3D => VERTEX_3D,
        VertexType::Vertex2DText => VERTEX_2D_TEXT,
        VertexType::Vertex2D => VERTEX_2D_PLAIN,
    }
}

/// Detect the vertex type per §4.8. The renderpass-name shortcut only
/// applies when a renderpass was explicitly declared, to avoid a circular
/// dependency with the renderpass default (which itself depends on vertex
/// type when omitted) -- see DESIGN.md's Open Question resolution.
fn detect_vertex_type(source: &ShaderConfigSource) -> VertexType {
    if let Some(rp) = &source.renderpass {
        if rp.eq_ignore_ascii_case(RENDERPASS_BUILTIN_UI) {
            return pick_2d_variant(source);
        }
    }
    let is_3d = source.raw_attributes.iter().any(|(ty, name)| {
        (name == "in_position" && matches!(ty, AttributeType::Vec3 | AttributeType::Vec4))
            || name == "in_normal"
    });
    if is_3d {
        VertexType::Vertex3D
    } else {
        pick_2d_variant(source)
    }
}

/// Distinguishes the two 2D expectation tables: the text variant also
/// carries a per-vertex color, the plain variant does not.
fn pick_2d_variant(source: &ShaderConfigSource) -> VertexType {
    if source.raw_attributes.iter().any(|(_, name)| name == "in_color") {
        VertexType::Vertex2DText
    } else {
        VertexType::Vertex2D
    }
}

fn default_renderpass_for(vertex_type: VertexType) -> &'static str {
    match vertex_type {
        VertexType::Vertex3D => RENDERPASS_BUILTIN_WORLD,
        VertexType::Vertex2D | VertexType::Vertex2DText => RENDERPASS_BUILTIN_UI,
    }
}

/// Compact the declared attributes onto the vertex-type's expectation
/// table: only attributes that are both expected and declared appear in
/// the output, in expectation order, with sequential locations and offsets
/// summed over the included attributes only (the "compaction" invariant in
/// §3). `attribute_stride` is the full vertex-type struct size regardless
/// of how many slots are actually populated.
fn compute_attribute_layout(
    source: &ShaderConfigSource,
    vertex_type: VertexType,
) -> (Vec<AttributeLayout>, u32, HashMap<String, u32>) {
    let table = expectation_table(vertex_type);
    let attribute_stride: u32 = table.iter().map(|e| e.attr_type.size()).sum();

    let mut attributes = Vec::new();
    let mut index_map = HashMap::new();
    let mut running_offset = 0u32;

    for expected in table {
        let declared = source.raw_attributes.iter().find(|(_, name)| name == expected.name);
        match declared {
            Some((_declared_type, name)) => {
                let location = attributes.len() as u32;
                let layout = AttributeLayout {
                    name: name.clone(),
                    attr_type: expected.attr_type,
                    location,
                    offset: running_offset,
                    size: expected.attr_type.size(),
                };
                running_offset += layout.size;
                index_map.insert(layout.name.clone(), location);
                attributes.push(layout);
            }
            None => {
                tracing::warn!(attribute = expected.name, "missing expected vertex attribute, omitting from layout");
            }
        }
    }

    (attributes, attribute_stride, index_map)
}

struct ScopeAccumulator {
    running: u32,
    texture_count: u32,
}

/// Walk declared uniforms in declaration order and assign offsets under the
/// std140-like packing rule (§4.8, P7). Returns the laid-out list plus the
/// per-scope accumulated sizes and texture-slot counts.
fn compute_uniform_layout(
    source: &ShaderConfigSource,
) -> (Vec<UniformLayout>, [ScopeAccumulator; 3], HashMap<String, u32>) {
    let mut acc = [
        ScopeAccumulator { running: 0, texture_count: 0 },
        ScopeAccumulator { running: 0, texture_count: 0 },
        ScopeAccumulator { running: 0, texture_count: 0 },
    ];
    let mut uniforms = Vec::new();
    let mut index_map = HashMap::new();

    for (uniform_type, scope, name) in &source.raw_uniforms {
        let scope_idx = *scope as usize;
        let entry = if uniform_type.is_sampler() {
            let location = acc[scope_idx].texture_count;
            acc[scope_idx].texture_count += 1;
            UniformLayout { name: name.clone(), uniform_type: *uniform_type, scope: *scope, location, offset: 0, size: 0 }
        } else {
            let align = if *scope == UniformScope::Local { 4 } else { uniform_type.alignment() };
            let size = uniform_type.size();
            let offset = if *scope == UniformScope::Local {
                align_up_u32(acc[scope_idx].running, align)
            } else {
                pack_offset(acc[scope_idx].running, align, size)
            };
            acc[scope_idx].running = offset + size;
            let location = uniforms.iter().filter(|u: &&UniformLayout| u.scope == *scope && !u.uniform_type.is_sampler()).count() as u32;
            UniformLayout { name: name.clone(), uniform_type: *uniform_type, scope: *scope, location, offset, size }
        };
        index_map.insert(entry.name.clone(), uniforms.len() as u32);
        uniforms.push(entry);
    }

    (uniforms, acc, index_map)
}

pub(crate) fn build(source: ShaderConfigSource) -> Result<ShaderConfig, ParseError> {
    let name = source.name.clone().ok_or_else(|| {
        ParseError::new(ParseErrorKind::MissingRequiredField, 0, 0, "missing required 'name'")
    })?;
    if source.stage_kinds.is_empty() {
        return Err(ParseError::new(ParseErrorKind::MissingRequiredField, 0, 0, "at least one stage is required"));
    }

    let vertex_type = detect_vertex_type(&source);
    let renderpass_name = source.renderpass.clone().unwrap_or_else(|| default_renderpass_for(vertex_type).to_string());

    let (attributes, attribute_stride, attribute_index) = compute_attribute_layout(&source, vertex_type);

    let (uniforms, scope_acc, uniform_index) = compute_uniform_layout(&source);
    let [global_acc, instance_acc, local_acc] = scope_acc;

    let global_ubo_size = align_up_u32(global_acc.running, 16);
    let instance_ubo_size = align_up_u32(instance_acc.running, 16);
    let push_constant_size = local_acc.running;

    let global_ubo_stride = align_up_u64(global_ubo_size as u64, UBO_ALIGNMENT) as u32;
    let instance_ubo_stride = align_up_u64(instance_ubo_size as u64, UBO_ALIGNMENT) as u32;
    let push_constant_stride = align_up_u32(push_constant_size, 4);

    let stages = source
        .stage_kinds
        .iter()
        .enumerate()
        .map(|(i, kind)| {
            let filename = if source.stage_files.len() == 1 {
                source.stage_files[0].clone()
            } else {
                source.stage_files.get(i).cloned().unwrap_or_default()
            };
            StageDescriptor { kind: *kind, entry_point: kind.canonical_entry_point().to_string(), filename }
        })
        .collect();

    Ok(ShaderConfig {
        name,
        renderpass_name,
        stages,
        attributes,
        uniforms,
        vertex_type,
        attribute_stride,
        global_ubo_size,
        global_ubo_stride,
        instance_ubo_size,
        instance_ubo_stride,
        push_constant_size,
        push_constant_stride,
        global_texture_count: global_acc.texture_count,
        instance_texture_count: instance_acc.texture_count,
        cull_mode: source.cull_mode,
        use_instance: source.use_instance,
        use_local: source.use_local,
        attribute_index,
        uniform_index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader_config::parser::parse;

    const EXAMPLE: &str = r#"
name = default.world
renderpass = Renderpass.Builtin.World
stages = vertex, fragment
stagefiles = default.world.spv
attribute = vec3, in_position
attribute = vec3, in_normal
attribute = vec2, in_texcoord
uniform = mat4, 0, view
uniform = mat4, 0, projection
uniform = vec4, 1, diffuse_color
uniform = samp,  1, diffuse_texture
use_instance = 1
use_local = 1
cull_mode = back
"#;

    fn build_example() -> ShaderConfig {
        let source = parse(EXAMPLE).unwrap();
        build(source).unwrap()
    }

    /// S3 — Parser round-trip.
    #[test]
    fn s3_example_world_shader_layout() {
        let cfg = build_example();
        assert_eq!(cfg.name, "default.world");
        assert_eq!(cfg.stages.len(), 2);
        assert_eq!(cfg.attributes[0], AttributeLayout { name: "in_position".into(), attr_type: AttributeType::Vec3, location: 0, offset: 0, size: 12 });
        assert_eq!(cfg.attributes[1], AttributeLayout { name: "in_normal".into(), attr_type: AttributeType::Vec3, location: 1, offset: 12, size: 12 });
        assert_eq!(cfg.attributes[2], AttributeLayout { name: "in_texcoord".into(), attr_type: AttributeType::Vec2, location: 2, offset: 24, size: 8 });
        assert_eq!(cfg.global_ubo_size, 128);
        assert_eq!(cfg.instance_ubo_size, 16);
        assert_eq!(cfg.instance_texture_count, 1);
        assert_eq!(cfg.push_constant_size, 0);
        assert_eq!(cfg.cull_mode, CullMode::Back);
    }

    /// P6 — determinism: running the computation twice yields identical output.
    #[test]
    fn p6_layout_computation_is_deterministic() {
        let source_a = parse(EXAMPLE).unwrap();
        let source_b = parse(EXAMPLE).unwrap();
        let cfg_a = build(source_a).unwrap();
        let cfg_b = build(source_b).unwrap();
        assert_eq!(cfg_a.attributes, cfg_b.attributes);
        assert_eq!(cfg_a.uniforms, cfg_b.uniforms);
        assert_eq!(cfg_a.global_ubo_size, cfg_b.global_ubo_size);
        assert_eq!(cfg_a.global_ubo_stride, cfg_b.global_ubo_stride);
    }

    /// P7 — register packing: no non-sampler uniform straddles a 16-byte
    /// register when its size is <= 16.
    #[test]
    fn p7_register_packing_holds_for_mixed_width_uniforms() {
        let text = "\
name = packed
stages = vertex, fragment
attribute = vec3, in_position
uniform = vec3, 0, a
uniform = float, 0, b
uniform = vec4, 0, c
uniform = float, 0, d
uniform = vec3, 0, e
";
        let cfg = build(parse(text).unwrap()).unwrap();
        for u in &cfg.uniforms {
            if u.uniform_type.is_sampler() {
                continue;
            }
            if u.size <= 16 {
                assert!((u.offset % 16) + u.size <= 16, "{:?} straddles a 16-byte register", u);
            }
        }
    }

    /// P8 — stride alignment.
    #[test]
    fn p8_ubo_and_push_constant_strides_are_aligned() {
        let cfg = build_example();
        assert_eq!(cfg.global_ubo_stride % 256, 0);
        assert_eq!(cfg.instance_ubo_stride % 256, 0);
        assert_eq!(cfg.push_constant_stride % 4, 0);

        let text = "\
name = with_push
stages = vertex
attribute = vec2, in_position
uniform = vec3, 2, model_offset
uniform = float, 2, intensity
";
        let cfg2 = build(parse(text).unwrap()).unwrap();
        assert_eq!(cfg2.push_constant_stride % 4, 0);
        assert!(cfg2.push_constant_size > 0);
    }

    #[test]
    fn missing_expected_attribute_is_omitted_and_compacted() {
        let text = "\
name = sparse
stages = vertex
attribute = vec3, in_position
attribute = vec2, in_texcoord
";
        let cfg = build(parse(text).unwrap()).unwrap();
        // in_normal is expected by the 3D table but not declared; in_texcoord
        // must still compact down to location 1 / offset 12, not its
        // uncompacted table offset of 24.
        assert_eq!(cfg.attributes.len(), 2);
        assert_eq!(cfg.attributes[1].name, "in_texcoord");
        assert_eq!(cfg.attributes[1].location, 1);
        assert_eq!(cfg.attributes[1].offset, 12);
    }

    #[test]
    fn renderpass_defaults_from_vertex_type_when_omitted() {
        let text_3d = "name = a\nstages = vertex\nattribute = vec3, in_position\n";
        let cfg_3d = build(parse(text_3d).unwrap()).unwrap();
        assert_eq!(cfg_3d.renderpass_name, RENDERPASS_BUILTIN_WORLD);

        let text_2d = "name = b\nstages = vertex\nattribute = vec2, in_position\n";
        let cfg_2d = build(parse(text_2d).unwrap()).unwrap();
        assert_eq!(cfg_2d.renderpass_name, RENDERPASS_BUILTIN_UI);
    }

    #[test]
    fn missing_name_is_rejected() {
        let text = "stages = vertex\n";
        let err = build(parse(text).unwrap()).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::MissingRequiredField);
    }
}
