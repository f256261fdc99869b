//! Projector/bake orchestration against a host 3D application.
//!
//! The host's rendering and baking primitives are collaborators, not part
//! of this crate: they enter through the [`SceneHost`] trait so the whole
//! sequence can run headlessly against stubs. The sequence itself is fixed:
//! render the target's camera view, generate the requested intrinsic maps,
//! project them from the camera onto a projector duplicate of the target
//! mesh, bake each map into the target's own UV space, then discard the
//! projector.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use image::RgbImage;
use tracing::info;

use crate::pipeline::IntrinsicLoraGenerator;
use crate::tasks::Task;

/// Host bake pass consuming one generated map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BakePass {
    Displacement,
    Normal,
    Diffuse,
    AmbientOcclusion,
}

impl From<Task> for BakePass {
    fn from(task: Task) -> Self {
        match task {
            Task::Depth => BakePass::Displacement,
            Task::Normal => BakePass::Normal,
            Task::Albedo => BakePass::Diffuse,
            Task::Shading => BakePass::AmbientOcclusion,
        }
    }
}

/// Per-invocation settings, mirroring the host-side render properties.
#[derive(Debug, Clone)]
pub struct BakeSettings {
    /// Maps to generate; processed in the fixed [`Task::ALL`] order
    /// regardless of the order given here.
    pub tasks: Vec<Task>,
    /// Side length of the rendered viewport and of the baked textures.
    pub size: u32,
    /// Remove the projector duplicate after baking.
    pub delete_projector: bool,
    /// Where the viewport render and the generated maps are written.
    pub output_dir: PathBuf,
}

impl BakeSettings {
    /// Request every supported map.
    pub fn all_maps<P: Into<PathBuf>>(output_dir: P, size: u32) -> Self {
        Self {
            tasks: Task::ALL.to_vec(),
            size,
            delete_projector: true,
            output_dir: output_dir.into(),
        }
    }

    /// Requested tasks in the fixed bake order, deduplicated.
    fn ordered_tasks(&self) -> Vec<Task> {
        Task::ALL
            .iter()
            .copied()
            .filter(|task| self.tasks.contains(task))
            .collect()
    }
}

/// Maps produced for one invocation, keyed by task.
#[derive(Default)]
pub struct TextureMaps {
    maps: HashMap<Task, RgbImage>,
}

impl TextureMaps {
    pub fn insert(&mut self, task: Task, map: RgbImage) {
        self.maps.insert(task, map);
    }

    pub fn get(&self, task: Task) -> Option<&RgbImage> {
        self.maps.get(&task)
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }
}

/// Image generation capability the driver consumes. Implemented by the
/// real generator; tests drive the sequence with stubs.
pub trait MapGenerator {
    fn generate_image(
        &mut self,
        input: &Path,
        output_dir: Option<&Path>,
        task: Task,
    ) -> Result<RgbImage>;

    fn close(self) -> Result<()>
    where
        Self: Sized;
}

impl MapGenerator for IntrinsicLoraGenerator {
    fn generate_image(
        &mut self,
        input: &Path,
        output_dir: Option<&Path>,
        task: Task,
    ) -> Result<RgbImage> {
        IntrinsicLoraGenerator::generate_image(self, input, output_dir, task)
    }

    fn close(self) -> Result<()> {
        IntrinsicLoraGenerator::close(self)
    }
}

/// Host operations the bake sequence needs. Object handles are opaque to
/// the driver; the projector handle is surrendered on removal.
pub trait SceneHost {
    type Object;

    /// Render the scene from the target's camera and return the written
    /// image path.
    fn render_viewport(&mut self, width: u32, height: u32, output_dir: &Path) -> Result<PathBuf>;

    /// Duplicate the target mesh with a fresh bake UV layer.
    fn create_projector(&mut self, target: &Self::Object) -> Result<Self::Object>;

    /// Co-locate and co-orient the projector with the target.
    fn align_projector(&mut self, projector: &Self::Object, target: &Self::Object) -> Result<()>;

    /// Build the projection shader graph feeding the generated maps.
    fn assign_projection_material(
        &mut self,
        projector: &Self::Object,
        maps: &TextureMaps,
    ) -> Result<()>;

    /// UV-project the projector from the active camera view.
    fn project_uvs_from_camera(&mut self, projector: &Self::Object) -> Result<()>;

    /// Bake one pass from the projector onto the target.
    fn bake(
        &mut self,
        projector: &Self::Object,
        target: &Self::Object,
        pass: BakePass,
        size: u32,
    ) -> Result<()>;

    /// Delete the projector and its material.
    fn remove_projector(&mut self, projector: Self::Object) -> Result<()>;
}

/// Run the full texture generation sequence for one target object.
///
/// The generator is consumed and torn down at the end of the run; errors
/// propagate immediately and abort the remainder of the sequence.
pub fn generate_textures<H: SceneHost, G: MapGenerator>(
    host: &mut H,
    mut generator: G,
    target: &H::Object,
    settings: &BakeSettings,
) -> Result<TextureMaps> {
    let rendered = host.render_viewport(settings.size, settings.size, &settings.output_dir)?;
    info!(input = %rendered.display(), "Viewport rendered");

    let mut maps = TextureMaps::default();
    for task in settings.ordered_tasks() {
        let map = generator.generate_image(&rendered, Some(&settings.output_dir), task)?;
        maps.insert(task, map);
    }

    if !maps.is_empty() {
        let projector = host.create_projector(target)?;
        host.align_projector(&projector, target)?;
        host.assign_projection_material(&projector, &maps)?;
        host.project_uvs_from_camera(&projector)?;
        for task in settings.ordered_tasks() {
            host.bake(&projector, target, BakePass::from(task), settings.size)?;
        }
        if settings.delete_projector {
            host.remove_projector(projector)?;
        }
        info!(maps = maps.len(), "Bake sequence complete");
    } else {
        info!("No maps requested, skipping projection");
    }

    generator.close()?;
    Ok(maps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    type OpLog = Rc<RefCell<Vec<String>>>;

    struct StubHost {
        log: OpLog,
    }

    impl SceneHost for StubHost {
        type Object = String;

        fn render_viewport(
            &mut self,
            width: u32,
            height: u32,
            output_dir: &Path,
        ) -> Result<PathBuf> {
            self.log.borrow_mut().push(format!("render {width}x{height}"));
            Ok(output_dir.join("intrinsic_render.png"))
        }

        fn create_projector(&mut self, target: &String) -> Result<String> {
            self.log.borrow_mut().push(format!("create_projector {target}"));
            Ok(format!("{target}.projector"))
        }

        fn align_projector(&mut self, _projector: &String, _target: &String) -> Result<()> {
            self.log.borrow_mut().push("align_projector".to_string());
            Ok(())
        }

        fn assign_projection_material(
            &mut self,
            _projector: &String,
            maps: &TextureMaps,
        ) -> Result<()> {
            self.log
                .borrow_mut()
                .push(format!("assign_material {}", maps.len()));
            Ok(())
        }

        fn project_uvs_from_camera(&mut self, _projector: &String) -> Result<()> {
            self.log.borrow_mut().push("project_uvs".to_string());
            Ok(())
        }

        fn bake(
            &mut self,
            _projector: &String,
            _target: &String,
            pass: BakePass,
            _size: u32,
        ) -> Result<()> {
            self.log.borrow_mut().push(format!("bake {pass:?}"));
            Ok(())
        }

        fn remove_projector(&mut self, projector: String) -> Result<()> {
            self.log
                .borrow_mut()
                .push(format!("remove_projector {projector}"));
            Ok(())
        }
    }

    struct StubGenerator {
        log: OpLog,
    }

    impl MapGenerator for StubGenerator {
        fn generate_image(
            &mut self,
            _input: &Path,
            _output_dir: Option<&Path>,
            task: Task,
        ) -> Result<RgbImage> {
            self.log.borrow_mut().push(format!("generate {task}"));
            Ok(RgbImage::new(4, 4))
        }

        fn close(self) -> Result<()> {
            self.log.borrow_mut().push("close".to_string());
            Ok(())
        }
    }

    fn run(settings: &BakeSettings) -> (Vec<String>, TextureMaps) {
        let log: OpLog = Rc::new(RefCell::new(Vec::new()));
        let mut host = StubHost { log: log.clone() };
        let generator = StubGenerator { log: log.clone() };
        let maps = generate_textures(&mut host, generator, &"target".to_string(), settings).unwrap();
        let ops = log.borrow().clone();
        (ops, maps)
    }

    #[test]
    fn test_full_sequence_order() {
        // Requested out of order: the driver still runs depth first.
        let settings = BakeSettings {
            tasks: vec![Task::Normal, Task::Depth],
            size: 512,
            delete_projector: true,
            output_dir: PathBuf::from("out"),
        };
        let (ops, maps) = run(&settings);
        assert_eq!(
            ops,
            vec![
                "render 512x512",
                "generate depth",
                "generate normal",
                "create_projector target",
                "align_projector",
                "assign_material 2",
                "project_uvs",
                "bake Displacement",
                "bake Normal",
                "remove_projector target.projector",
                "close",
            ]
        );
        assert!(maps.get(Task::Depth).is_some());
        assert!(maps.get(Task::Normal).is_some());
        assert!(maps.get(Task::Albedo).is_none());
    }

    #[test]
    fn test_projector_kept_when_requested() {
        let settings = BakeSettings {
            tasks: vec![Task::Albedo],
            size: 256,
            delete_projector: false,
            output_dir: PathBuf::from("out"),
        };
        let (ops, _) = run(&settings);
        assert!(ops.contains(&"bake Diffuse".to_string()));
        assert!(!ops.iter().any(|op| op.starts_with("remove_projector")));
    }

    #[test]
    fn test_no_tasks_skips_projection() {
        let settings = BakeSettings {
            tasks: vec![],
            size: 512,
            delete_projector: true,
            output_dir: PathBuf::from("out"),
        };
        let (ops, maps) = run(&settings);
        assert_eq!(ops, vec!["render 512x512", "close"]);
        assert!(maps.is_empty());
    }

    #[test]
    fn test_bake_pass_mapping() {
        assert_eq!(BakePass::from(Task::Depth), BakePass::Displacement);
        assert_eq!(BakePass::from(Task::Normal), BakePass::Normal);
        assert_eq!(BakePass::from(Task::Albedo), BakePass::Diffuse);
        assert_eq!(BakePass::from(Task::Shading), BakePass::AmbientOcclusion);
    }

    #[test]
    fn test_ordered_tasks_deduplicates() {
        let settings = BakeSettings {
            tasks: vec![Task::Shading, Task::Depth, Task::Shading],
            size: 512,
            delete_projector: true,
            output_dir: PathBuf::from("out"),
        };
        assert_eq!(settings.ordered_tasks(), vec![Task::Depth, Task::Shading]);
    }

    #[test]
    fn test_all_maps_settings() {
        let settings = BakeSettings::all_maps("out", 512);
        assert_eq!(settings.tasks, Task::ALL.to_vec());
        assert!(settings.delete_projector);
    }
}
