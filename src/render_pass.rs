//! Render-pass registry, domain defaults, and chaining rules (C6, §4.4).
//!
//! Attachment load/store ops and layouts are computed here as plain data —
//! no device calls — so the chaining invariant (P4) can be checked without a
//! GPU. The Vulkan backend turns [`AttachmentDescription`] into a real
//! `vk::AttachmentDescription` and builds the actual `vk::RenderPass`.

use ash::vk;
use fxhash::FxHashMap;

use crate::resources::ClearFlags;

pub const BUILTIN_SKYBOX: &str = "Renderpass.Builtin.Skybox";
pub const BUILTIN_WORLD: &str = "Renderpass.Builtin.World";
pub const BUILTIN_UI: &str = "Renderpass.Builtin.UI";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderPassDomain {
    World,
    WorldTransparent,
    Ui,
    Shadow,
    Post,
    Compute,
    Skybox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    /// Intersect with a target's dimensions, clamped to a minimum of 1x1
    /// (§4.4 `begin_render_pass`).
    pub fn intersect_clamped(&self, target_width: u32, target_height: u32) -> Rect {
        let x = self.x.min(target_width.saturating_sub(1));
        let y = self.y.min(target_height.saturating_sub(1));
        let width = self.width.min(target_width.saturating_sub(x)).max(1);
        let height = self.height.min(target_height.saturating_sub(y)).max(1);
        Rect { x, y, width, height }
    }
}

/// A pass as the host (or a built-in default) describes it, before the
/// attachment descriptions are derived.
#[derive(Debug, Clone)]
pub struct RenderPassConfig {
    pub name: String,
    pub prev_name: String,
    pub next_name: String,
    pub domain: RenderPassDomain,
    pub render_area: Rect,
    pub clear_color: [f32; 4],
    pub clear_flags: ClearFlags,
}

impl RenderPassConfig {
    pub fn has_prev(&self) -> bool {
        !self.prev_name.is_empty()
    }

    pub fn has_next(&self) -> bool {
        !self.next_name.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentDescription {
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

/// Derive the color attachment description from a pass's neighbours and
/// clear flags (§4.4 table). `SHADOW`'s depth-only final layout and `POST`'s
/// forced-terminal layout are domain overrides applied by the caller, not
/// here — this function only implements the generic prev/next table.
pub fn color_attachment(config: &RenderPassConfig) -> AttachmentDescription {
    let load_op = if config.has_prev() {
        vk::AttachmentLoadOp::LOAD
    } else if config.clear_flags.contains(ClearFlags::CLEAR_COLOR) {
        vk::AttachmentLoadOp::CLEAR
    } else {
        vk::AttachmentLoadOp::DONT_CARE
    };
    let initial_layout = if config.has_prev() {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
    } else {
        vk::ImageLayout::UNDEFINED
    };
    let final_layout = if config.has_next() {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
    } else {
        vk::ImageLayout::PRESENT_SRC_KHR
    };
    AttachmentDescription { load_op, store_op: vk::AttachmentStoreOp::STORE, initial_layout, final_layout }
}

/// Derive the depth attachment description; `None` when the pass does not
/// use a depth aspect.
pub fn depth_attachment(config: &RenderPassConfig) -> Option<AttachmentDescription> {
    if !config.clear_flags.contains(ClearFlags::USE_DEPTH) {
        return None;
    }
    let clearing = config.clear_flags.contains(ClearFlags::CLEAR_DEPTH);
    let load_op = if clearing { vk::AttachmentLoadOp::CLEAR } else { vk::AttachmentLoadOp::LOAD };
    let store_op = if config.has_next() { vk::AttachmentStoreOp::STORE } else { vk::AttachmentStoreOp::DONT_CARE };
    let initial_layout = if clearing { vk::ImageLayout::UNDEFINED } else { vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL };
    Some(AttachmentDescription { load_op, store_op, initial_layout, final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL })
}

/// SHADOW overrides the generic depth final layout to make the shadow map
/// sampleable by subsequent fragment shaders (§4.4).
pub fn shadow_depth_attachment(config: &RenderPassConfig) -> AttachmentDescription {
    let mut attachment = depth_attachment(config).expect("shadow pass must set USE_DEPTH");
    attachment.final_layout = vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL;
    attachment
}

/// Subpass dependencies for the pass's single subpass (§4.4): external->0
/// and 0->external, both directions, so a pass is correctly ordered
/// against whatever came before and after it even when neighbouring passes
/// aren't chained through matching layouts. Depth stage/access is added to
/// both directions when `USE_DEPTH` is set. `SHADOW`'s 0->external edge
/// additionally waits out a `FRAGMENT_SHADER` read, since later passes
/// sample the shadow map it just wrote.
pub fn subpass_dependencies(config: &RenderPassConfig) -> [vk::SubpassDependency; 2] {
    let use_depth = config.clear_flags.contains(ClearFlags::USE_DEPTH);

    let mut stage_mask = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
    let mut write_access = vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
    if use_depth {
        stage_mask |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
        write_access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
    }

    let external_to_zero = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(stage_mask)
        .dst_stage_mask(stage_mask)
        .dst_access_mask(write_access)
        .build();

    let mut zero_to_external = vk::SubpassDependency::builder()
        .src_subpass(0)
        .dst_subpass(vk::SUBPASS_EXTERNAL)
        .src_stage_mask(stage_mask)
        .dst_stage_mask(vk::PipelineStageFlags::BOTTOM_OF_PIPE)
        .src_access_mask(write_access);
    if config.domain == RenderPassDomain::Shadow {
        zero_to_external = zero_to_external.dst_stage_mask(vk::PipelineStageFlags::FRAGMENT_SHADER).dst_access_mask(vk::AccessFlags::SHADER_READ);
    }

    [external_to_zero, zero_to_external.build()]
}

/// P4 — chaining invariant: for a pair `A -> B`, `A`'s color final layout
/// must equal `B`'s color initial layout so no transition is inserted
/// between them.
pub fn chain_is_consistent(a: &RenderPassConfig, b: &RenderPassConfig) -> bool {
    a.next_name.eq_ignore_ascii_case(&b.name) && color_attachment(a).final_layout == color_attachment(b).initial_layout
}

fn builtin_skybox() -> RenderPassConfig {
    RenderPassConfig {
        name: BUILTIN_SKYBOX.to_string(),
        prev_name: String::new(),
        next_name: BUILTIN_WORLD.to_string(),
        domain: RenderPassDomain::Skybox,
        render_area: Rect::default(),
        clear_color: [0.0, 0.0, 0.0, 1.0],
        clear_flags: ClearFlags::CLEAR_COLOR,
    }
}

fn builtin_world() -> RenderPassConfig {
    RenderPassConfig {
        name: BUILTIN_WORLD.to_string(),
        prev_name: BUILTIN_SKYBOX.to_string(),
        next_name: BUILTIN_UI.to_string(),
        domain: RenderPassDomain::World,
        render_area: Rect::default(),
        clear_color: [0.0, 0.0, 0.0, 1.0],
        clear_flags: ClearFlags::CLEAR_COLOR | ClearFlags::CLEAR_DEPTH | ClearFlags::USE_DEPTH,
    }
}

fn builtin_ui() -> RenderPassConfig {
    RenderPassConfig {
        name: BUILTIN_UI.to_string(),
        prev_name: BUILTIN_WORLD.to_string(),
        next_name: String::new(),
        domain: RenderPassDomain::Ui,
        render_area: Rect::default(),
        clear_color: [0.0, 0.0, 0.0, 1.0],
        clear_flags: ClearFlags::empty(),
    }
}

/// Bounded, case-insensitive-keyed collection of passes. Built-ins are
/// registered first; host-supplied configs of the same name replace them
/// (§4.4).
#[derive(Debug, Clone)]
pub struct RenderPassRegistry {
    passes: FxHashMap<String, RenderPassConfig>,
}

impl RenderPassRegistry {
    pub fn new() -> Self {
        let mut registry = RenderPassRegistry { passes: FxHashMap::default() };
        for builtin in [builtin_skybox(), builtin_world(), builtin_ui()] {
            registry.register(builtin);
        }
        registry
    }

    pub fn register(&mut self, config: RenderPassConfig) {
        self.passes.insert(config.name.to_ascii_lowercase(), config);
    }

    pub fn get(&self, name: &str) -> Option<&RenderPassConfig> {
        self.passes.get(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }
}

impl Default for RenderPassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_present_and_chained_skybox_world_ui() {
        let registry = RenderPassRegistry::new();
        assert!(registry.get(BUILTIN_SKYBOX).is_some());
        assert!(registry.get(BUILTIN_WORLD).is_some());
        assert!(registry.get(BUILTIN_UI).is_some());
        // Lookup is case-insensitive.
        assert!(registry.get("renderpass.builtin.ui").is_some());
    }

    /// P4 over the full built-in chain.
    #[test]
    fn p4_builtin_chain_has_no_layout_mismatch() {
        let registry = RenderPassRegistry::new();
        let skybox = registry.get(BUILTIN_SKYBOX).unwrap();
        let world = registry.get(BUILTIN_WORLD).unwrap();
        let ui = registry.get(BUILTIN_UI).unwrap();
        assert!(chain_is_consistent(skybox, world));
        assert!(chain_is_consistent(world, ui));
    }

    #[test]
    fn terminal_pass_color_final_layout_is_present_src() {
        let registry = RenderPassRegistry::new();
        let ui = registry.get(BUILTIN_UI).unwrap();
        assert_eq!(color_attachment(ui).final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn host_supplied_pass_overrides_builtin_of_same_name() {
        let mut registry = RenderPassRegistry::new();
        let mut custom = builtin_ui();
        custom.clear_color = [1.0, 0.0, 0.0, 1.0];
        registry.register(custom);
        assert_eq!(registry.get(BUILTIN_UI).unwrap().clear_color, [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn shadow_pass_depth_final_layout_is_read_only() {
        let shadow = RenderPassConfig {
            name: "shadow".into(),
            prev_name: String::new(),
            next_name: String::new(),
            domain: RenderPassDomain::Shadow,
            render_area: Rect::default(),
            clear_color: [0.0; 4],
            clear_flags: ClearFlags::CLEAR_DEPTH | ClearFlags::USE_DEPTH,
        };
        assert_eq!(shadow_depth_attachment(&shadow).final_layout, vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn subpass_dependencies_carry_depth_stages_both_directions_when_use_depth_set() {
        let registry = RenderPassRegistry::new();
        let world = registry.get(BUILTIN_WORLD).unwrap();
        let [external_to_zero, zero_to_external] = subpass_dependencies(world);
        let depth_stages = vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
        assert!(external_to_zero.dst_stage_mask.contains(depth_stages));
        assert!(external_to_zero.dst_access_mask.contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE));
        assert!(zero_to_external.src_stage_mask.contains(depth_stages));
        assert!(zero_to_external.src_access_mask.contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE));
    }

    #[test]
    fn subpass_dependencies_omit_depth_stages_when_use_depth_unset() {
        let registry = RenderPassRegistry::new();
        let ui = registry.get(BUILTIN_UI).unwrap();
        let [external_to_zero, zero_to_external] = subpass_dependencies(ui);
        let depth_stages = vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
        assert!(!external_to_zero.dst_stage_mask.contains(depth_stages));
        assert!(!zero_to_external.src_stage_mask.contains(depth_stages));
    }

    #[test]
    fn shadow_pass_zero_to_external_dependency_signals_fragment_shader_read() {
        let shadow = RenderPassConfig {
            name: "shadow".into(),
            prev_name: String::new(),
            next_name: String::new(),
            domain: RenderPassDomain::Shadow,
            render_area: Rect::default(),
            clear_color: [0.0; 4],
            clear_flags: ClearFlags::CLEAR_DEPTH | ClearFlags::USE_DEPTH,
        };
        let [_, zero_to_external] = subpass_dependencies(&shadow);
        assert!(zero_to_external.dst_stage_mask.contains(vk::PipelineStageFlags::FRAGMENT_SHADER));
        assert!(zero_to_external.dst_access_mask.contains(vk::AccessFlags::SHADER_READ));
    }

    #[test]
    fn render_area_is_clamped_to_target_with_minimum_extent() {
        let area = Rect { x: 0, y: 0, width: 4000, height: 4000 };
        let clamped = area.intersect_clamped(800, 600);
        assert_eq!(clamped, Rect { x: 0, y: 0, width: 800, height: 600 });

        let zero = Rect { x: 0, y: 0, width: 0, height: 0 }.intersect_clamped(0, 0);
        assert_eq!(zero, Rect { x: 0, y: 0, width: 1, height: 1 });
    }
}
