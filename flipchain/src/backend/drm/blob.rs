// This is a modified version of smithay's code to read the format/modifier
// info from the IN_FORMATS DRM blob. This is the only example of how to do
// this with the drm-rs crate and although it has some significant changes it's
// still similar enough I felt it needed to retain the original license header.
// For that reason it is in this separate file.

extern crate drm_ffi;
use super::drm::control::{plane, property, Device as ControlDevice};
use super::drm_device::DrmDevice;

use crate::{Result, WsiError};
use utils::log;

// MIT License
//
// Copyright (c) 2017 Victor Berger and Victoria Brekenfeld
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

/// Every (fourcc, modifier) pair a plane can scan out
pub fn get_plane_formats(drm: &DrmDevice, plane: plane::Handle) -> Result<Vec<(u32, u64)>> {
    let mut formats = Vec::new();

    let plane_props = drm.get_properties(plane).or(Err(WsiError::SURFACE_LOST))?;

    let in_formats = plane_props
        .as_hashmap(drm)
        .or(Err(WsiError::SURFACE_LOST))?
        .get("IN_FORMATS")
        .map(|info| info.handle())
        .ok_or_else(|| {
            log::error!("DRM plane has no IN_FORMATS property");
            WsiError::FORMAT_NOT_SUPPORTED
        })?;
    let mods_info = drm.get_property(in_formats).map_err(|e| {
        log::error!("Could not get DRM format/modifier info: {:?}", e);
        WsiError::SURFACE_LOST
    })?;

    // Start by finding the blob id for our IN_FORMATS property
    let (handles, raw_values) = plane_props.as_props_and_values();
    let blob_id = handles
        .iter()
        .position(|handle| *handle == in_formats)
        .map(|i| raw_values[i])
        .ok_or(WsiError::SURFACE_LOST)?;

    // Get the blob value instead of a raw int
    let blob = match mods_info.value_type().convert_value(blob_id) {
        property::Value::Blob(blob) => blob,
        _ => return Err(WsiError::SURFACE_LOST),
    };
    let data = drm.get_property_blob(blob).map_err(|e| {
        log::error!("Could not get DRM format/modifier info: {:?}", e);
        WsiError::SURFACE_LOST
    })?;

    // Now we have to do the equivalent of drmModeFormatModifierBlobIterNext() be careful here,
    // we have no idea about the alignment inside the blob, so always copy using
    // `read_unaligned`, although slice::from_raw_parts would be so much nicer to iterate and
    // to read.
    unsafe {
        let fmt_mod_blob_ptr = data.as_ptr() as *const drm_ffi::drm_format_modifier_blob;
        let fmt_mod_blob = fmt_mod_blob_ptr.read_unaligned();

        let formats_ptr: *const u32 = fmt_mod_blob_ptr
            .cast::<u8>()
            .offset(fmt_mod_blob.formats_offset as isize)
            as *const _;
        let modifiers_ptr: *const drm_ffi::drm_format_modifier = fmt_mod_blob_ptr
            .cast::<u8>()
            .offset(fmt_mod_blob.modifiers_offset as isize)
            as *const _;

        for i in 0..fmt_mod_blob.count_modifiers {
            let mod_info = modifiers_ptr.offset(i as isize).read_unaligned();
            for j in 0..64 {
                if mod_info.formats & (1u64 << j) == 0 {
                    continue;
                }
                let fourcc = formats_ptr
                    .offset((j + mod_info.offset) as isize)
                    .read_unaligned();

                let pair = (fourcc, mod_info.modifier);
                if !formats.contains(&pair) {
                    formats.push(pair);
                }
            }
        }
    }

    log::debug!("Plane supports {} format/modifier pairs", formats.len());
    Ok(formats)
}
