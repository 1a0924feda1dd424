use crate::{Camera, Reconstruction};
use nalgebra::{Point3, Vector3};
use ply_rs::{
    ply::{
        Addable, DefaultElement, ElementDef, Encoding, Ply, Property, PropertyDef, PropertyType,
        ScalarType,
    },
    writer::Writer,
};
use std::io::{self, Write};

const CAMERA_COLOR: [u8; 3] = [255, 0, 255];

/// A camera drawn as a pyramid from its optical center.
pub struct ExportCamera {
    pub optical_center: Point3<f64>,
    pub up_direction: Vector3<f64>,
    pub forward_direction: Vector3<f64>,
    /// The size of the pyramid in world units.
    pub focal_length: f64,
}

impl ExportCamera {
    pub fn new(camera: &Camera, focal_length: f64) -> Self {
        let to_world = camera.rotation.inverse();
        Self {
            optical_center: camera.optical_center(),
            // Image rows grow downwards, so up is negative camera y.
            up_direction: to_world * -Vector3::y(),
            forward_direction: to_world * Vector3::z(),
            focal_length,
        }
    }
}

/// Writes the tracks of a reconstruction as colored vertices, with optional camera pyramids.
pub fn export_reconstruction(
    writer: impl Write,
    reconstruction: &Reconstruction,
    camera_size: Option<f64>,
    camera_faces: bool,
) -> io::Result<()> {
    let (points, colors) = reconstruction.export_points();
    let cameras = match camera_size {
        Some(size) => reconstruction
            .cameras()
            .map(|camera| ExportCamera::new(camera, size))
            .collect(),
        None => vec![],
    };
    export(
        writer,
        points.into_iter().zip(colors).collect(),
        cameras,
        camera_faces,
    )
}

/// Writes an ASCII PLY file with `x y z red green blue` vertices.
pub fn export(
    mut writer: impl Write,
    points_and_colors: Vec<(Point3<f64>, [u8; 3])>,
    cameras: Vec<ExportCamera>,
    camera_faces: bool,
) -> io::Result<()> {
    let mut ply = Ply::<DefaultElement>::new();
    ply.header.encoding = Encoding::Ascii;
    ply.header
        .comments
        .push("Exported from rust-cv/cv-sfm".to_string());

    // The vertex element holds both reconstruction points and camera corners.
    let mut point_element = ElementDef::new("vertex".to_string());
    for axis in ["x", "y", "z"] {
        point_element.properties.add(PropertyDef::new(
            axis.to_string(),
            PropertyType::Scalar(ScalarType::Double),
        ));
    }
    for channel in ["red", "green", "blue"] {
        point_element.properties.add(PropertyDef::new(
            channel.to_string(),
            PropertyType::Scalar(ScalarType::UChar),
        ));
    }
    ply.header.elements.add(point_element);

    let camera_faces = camera_faces && !cameras.is_empty();
    if camera_faces {
        let mut face_element = ElementDef::new("face".to_string());
        let vertex_list = PropertyDef::new(
            "vertex_index".to_string(),
            PropertyType::List(ScalarType::UChar, ScalarType::Int),
        );
        face_element.properties.add(vertex_list);
        ply.header.elements.add(face_element);
    }

    let mut faces: Vec<DefaultElement> = vec![];
    let mut vertices: Vec<DefaultElement> = vec![];

    let mut add_vertex = |p: Point3<f64>, [r, g, b]: [u8; 3]| -> usize {
        let pos = vertices.len();
        let mut point = DefaultElement::new();
        point.insert("x".to_string(), Property::Double(p.x));
        point.insert("y".to_string(), Property::Double(p.y));
        point.insert("z".to_string(), Property::Double(p.z));
        point.insert("red".to_string(), Property::UChar(r));
        point.insert("green".to_string(), Property::UChar(g));
        point.insert("blue".to_string(), Property::UChar(b));
        vertices.push(point);
        pos
    };

    let mut add_triangle = |a: usize, b: usize, c: usize| {
        let mut face = DefaultElement::new();
        face.insert(
            "vertex_index".to_string(),
            Property::ListInt(vec![a as i32, b as i32, c as i32]),
        );
        faces.push(face);
    };

    for ExportCamera {
        optical_center,
        up_direction,
        forward_direction,
        focal_length,
    } in cameras
    {
        let right_direction = forward_direction.cross(&up_direction);
        let center_point = add_vertex(optical_center, CAMERA_COLOR);
        let [up_right, up_left, down_left, down_right] =
            [(1, 1), (1, -1), (-1, -1), (-1, 1)].map(|(up, right)| {
                add_vertex(
                    optical_center
                        + forward_direction * focal_length
                        + up as f64 * up_direction * focal_length
                        + right as f64 * right_direction * focal_length,
                    CAMERA_COLOR,
                )
            });

        if camera_faces {
            add_triangle(center_point, down_right, up_right);
            add_triangle(center_point, up_right, up_left);
            add_triangle(center_point, up_left, down_left);
            add_triangle(center_point, down_left, down_right);
        }
    }

    for (p, c) in points_and_colors {
        add_vertex(p, c);
    }

    ply.payload.insert("vertex".to_string(), vertices);
    if camera_faces {
        ply.payload.insert("face".to_string(), faces);
    }

    Writer::new().write_ply(&mut writer, &mut ply)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use nalgebra::Rotation3;

    #[test]
    fn exports_points_and_cameras() {
        let mut reconstruction = Reconstruction::new();
        reconstruction
            .add_camera(crate::CameraId(0), Rotation3::identity(), Vector3::zeros())
            .unwrap();
        reconstruction
            .add_camera(crate::CameraId(1), Rotation3::identity(), -Vector3::x())
            .unwrap();
        reconstruction
            .create_track(
                Point3::new(0.5, 0.0, 3.0),
                [10, 20, 30],
                btreemap! { crate::CameraId(0) => 0, crate::CameraId(1) => 0 },
            )
            .unwrap();

        let mut out = vec![];
        export_reconstruction(&mut out, &reconstruction, Some(0.1), true).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("ply\n"));
        // One point plus five vertices per camera.
        assert!(text.contains("element vertex 11"));
        assert!(text.contains("element face 8"));
        assert!(text.contains("10 20 30"));
    }
}
