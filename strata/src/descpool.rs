/*
 * An allocator for descriptor sets
 *
 * Every pipeline in the compositor has exactly one set layout. A
 * DescriptorSystem owns that layout and hands out sets from a growing
 * list of pools.
 */

use crate::device::Device;
use crate::{Result, StrataError};
use ash::vk;
use std::sync::{Arc, Mutex};

/// The default size of each pool in DescPool
static POOL_SIZE: u32 = 16;

/// One binding of a set layout
#[derive(Debug, Copy, Clone)]
pub struct LayoutBinding {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

impl LayoutBinding {
    pub fn new(binding: u32, ty: vk::DescriptorType, count: u32, stages: vk::ShaderStageFlags) -> Self {
        Self {
            binding: binding,
            ty: ty,
            count: count,
            stages: stages,
        }
    }
}

/// Single descriptor set
///
/// When this is dropped the set will be freed and returned to the pool.
pub struct Descriptor {
    /// The owning pool
    d_pool: Arc<Mutex<DescPool>>,
    /// The descriptor set itself
    pub(crate) d_set: vk::DescriptorSet,
}

impl Drop for Descriptor {
    fn drop(&mut self) {
        self.d_pool.lock().unwrap().free_set(self.d_set);
    }
}

/// One vkDescriptorPool
pub struct DescPool {
    dp_dev: Arc<Device>,
    dp_pool: vk::DescriptorPool,
    /// number of allocations made from this pool, from 0 to POOL_SIZE
    dp_capacity: usize,
}

impl Drop for DescPool {
    fn drop(&mut self) {
        unsafe {
            self.dp_dev.dev.destroy_descriptor_pool(self.dp_pool, None);
        }
    }
}

impl DescPool {
    /// Allocate one set from this pool
    ///
    /// Returns None if this pool is full.
    fn alloc_descriptor(&mut self, layout: vk::DescriptorSetLayout) -> Result<Option<vk::DescriptorSet>> {
        if self.dp_capacity >= POOL_SIZE as usize {
            return Ok(None);
        }

        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.dp_pool)
            .set_layouts(&layouts)
            .build();

        let sets = match unsafe { self.dp_dev.dev.allocate_descriptor_sets(&info) } {
            Ok(sets) => sets,
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY) => return Ok(None),
            Err(e) => return Err(StrataError::from(e)),
        };

        self.dp_capacity += 1;
        Ok(sets.get(0).cloned())
    }

    /// Free one set in this pool
    ///
    /// This frees the set object, and decrements the tracker of sets
    /// allocated from this pool
    fn free_set(&mut self, set: vk::DescriptorSet) {
        unsafe {
            let _ = self.dp_dev.dev.free_descriptor_sets(self.dp_pool, &[set]);
        }
        self.dp_capacity -= 1;
    }
}

/// The overall descriptor tracker
///
/// This is in charge of fulfilling allocation requests by finding an
/// open pool to allocate from.
pub struct DescriptorSystem {
    ds_dev: Arc<Device>,
    ds_layout: vk::DescriptorSetLayout,
    ds_bindings: Vec<LayoutBinding>,
    ds_pools: Vec<Arc<Mutex<DescPool>>>,
}

impl DescriptorSystem {
    /// Allocate one Descriptor from the first available pool
    ///
    /// This may add a new pool to the system if needed.
    pub fn alloc_descriptor(&mut self) -> Result<Descriptor> {
        for pool in self.ds_pools.iter() {
            if let Some(set) = pool.lock().unwrap().alloc_descriptor(self.ds_layout)? {
                return Ok(Descriptor {
                    d_pool: pool.clone(),
                    d_set: set,
                });
            }
        }

        // If we couldn't find a pool then add a new one
        let pool = self.add_pool()?;
        let set = pool
            .lock()
            .unwrap()
            .alloc_descriptor(self.ds_layout)?
            .ok_or(StrataError::OUT_OF_RESOURCES)?;

        Ok(Descriptor {
            d_pool: pool,
            d_set: set,
        })
    }

    /// Create the set layout
    ///
    /// Descriptor layouts specify the number and characteristics
    /// of descriptor sets which will be made available to the
    /// pipeline through the pipeline layout.
    fn create_layout(dev: &Device, bindings: &[LayoutBinding]) -> Result<vk::DescriptorSetLayout> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(b.binding)
                    .descriptor_type(b.ty)
                    .stage_flags(b.stages)
                    .descriptor_count(b.count)
                    .build()
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&vk_bindings);

        unsafe {
            dev.dev
                .create_descriptor_set_layout(&info, None)
                .map_err(StrataError::from)
        }
    }

    /// Adds and returns a new DescPool in the system
    fn add_pool(&mut self) -> Result<Arc<Mutex<DescPool>>> {
        let sizes: Vec<vk::DescriptorPoolSize> = self
            .ds_bindings
            .iter()
            .map(|b| {
                vk::DescriptorPoolSize::builder()
                    .ty(b.ty)
                    .descriptor_count(b.count * POOL_SIZE)
                    .build()
            })
            .collect();

        let info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&sizes)
            // we want to be able to free descriptor sets individually
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(POOL_SIZE)
            .build();

        let pool = unsafe {
            self.ds_dev
                .dev
                .create_descriptor_pool(&info, None)
                .map_err(StrataError::from)?
        };

        let ret = Arc::new(Mutex::new(DescPool {
            dp_dev: self.ds_dev.clone(),
            dp_pool: pool,
            dp_capacity: 0,
        }));

        self.ds_pools.push(ret.clone());

        Ok(ret)
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.ds_layout
    }

    pub fn new(dev: Arc<Device>, bindings: &[LayoutBinding]) -> Result<Self> {
        Ok(Self {
            ds_layout: Self::create_layout(&dev, bindings)?,
            ds_bindings: bindings.to_vec(),
            ds_dev: dev,
            ds_pools: Vec::new(),
        })
    }
}

impl Drop for DescriptorSystem {
    fn drop(&mut self) {
        // Every Descriptor holds its pool alive, but the layout is ours
        unsafe {
            self.ds_dev
                .dev
                .destroy_descriptor_set_layout(self.ds_layout, None);
        }
    }
}
