/// COCO 80类标签表 (名称 + 显示颜色)
/// COCO label table used to name and color primary detections.
use serde::Serialize;

/// 类别标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClassLabel {
    pub name: &'static str,
    pub color: [u8; 3],
}

/// 越界类别ID使用的标签
pub const UNKNOWN_LABEL: ClassLabel = ClassLabel {
    name: "unknown",
    color: [128, 128, 128],
};

pub const PERSON_CLASS_ID: u32 = 0;

pub const COCO_LABELS: [ClassLabel; 80] = [
    ClassLabel { name: "person", color: [0, 255, 0] },
    // 交通工具
    ClassLabel { name: "bicycle", color: [255, 0, 255] },
    ClassLabel { name: "car", color: [255, 0, 0] },
    ClassLabel { name: "motorcycle", color: [255, 255, 0] },
    ClassLabel { name: "airplane", color: [128, 0, 128] },
    ClassLabel { name: "bus", color: [0, 128, 255] },
    ClassLabel { name: "train", color: [165, 42, 42] },
    ClassLabel { name: "truck", color: [0, 0, 255] },
    ClassLabel { name: "boat", color: [0, 255, 255] },
    // 街道设施
    ClassLabel { name: "traffic light", color: [255, 140, 0] },
    ClassLabel { name: "fire hydrant", color: [220, 20, 60] },
    ClassLabel { name: "stop sign", color: [255, 69, 0] },
    ClassLabel { name: "parking meter", color: [128, 128, 128] },
    ClassLabel { name: "bench", color: [139, 69, 19] },
    // 动物
    ClassLabel { name: "bird", color: [0, 255, 127] },
    ClassLabel { name: "cat", color: [218, 112, 214] },
    ClassLabel { name: "dog", color: [160, 82, 45] },
    ClassLabel { name: "horse", color: [255, 140, 0] },
    ClassLabel { name: "sheep", color: [255, 248, 220] },
    ClassLabel { name: "cow", color: [210, 105, 30] },
    ClassLabel { name: "elephant", color: [169, 169, 169] },
    ClassLabel { name: "bear", color: [139, 69, 19] },
    ClassLabel { name: "zebra", color: [112, 128, 144] },
    ClassLabel { name: "giraffe", color: [218, 165, 32] },
    // 随身物品
    ClassLabel { name: "backpack", color: [47, 79, 79] },
    ClassLabel { name: "umbrella", color: [25, 25, 112] },
    ClassLabel { name: "handbag", color: [188, 143, 143] },
    ClassLabel { name: "tie", color: [72, 61, 139] },
    ClassLabel { name: "suitcase", color: [199, 21, 133] },
    // 运动器材
    ClassLabel { name: "frisbee", color: [32, 178, 170] },
    ClassLabel { name: "skis", color: [219, 112, 147] },
    ClassLabel { name: "snowboard", color: [255, 182, 193] },
    ClassLabel { name: "sports ball", color: [176, 224, 230] },
    ClassLabel { name: "kite", color: [127, 255, 212] },
    ClassLabel { name: "baseball bat", color: [176, 196, 222] },
    ClassLabel { name: "baseball glove", color: [230, 230, 250] },
    ClassLabel { name: "skateboard", color: [244, 164, 96] },
    ClassLabel { name: "surfboard", color: [70, 130, 180] },
    ClassLabel { name: "tennis racket", color: [210, 180, 140] },
    // 餐具
    ClassLabel { name: "bottle", color: [0, 206, 209] },
    ClassLabel { name: "wine glass", color: [147, 112, 219] },
    ClassLabel { name: "cup", color: [60, 179, 113] },
    ClassLabel { name: "fork", color: [186, 85, 211] },
    ClassLabel { name: "knife", color: [123, 104, 238] },
    ClassLabel { name: "spoon", color: [0, 250, 154] },
    ClassLabel { name: "bowl", color: [72, 209, 204] },
    // 食物
    ClassLabel { name: "banana", color: [238, 232, 170] },
    ClassLabel { name: "apple", color: [152, 251, 152] },
    ClassLabel { name: "sandwich", color: [222, 184, 135] },
    ClassLabel { name: "orange", color: [255, 160, 122] },
    ClassLabel { name: "broccoli", color: [34, 139, 34] },
    ClassLabel { name: "carrot", color: [255, 127, 80] },
    ClassLabel { name: "hot dog", color: [233, 150, 122] },
    ClassLabel { name: "pizza", color: [240, 128, 128] },
    ClassLabel { name: "donut", color: [255, 192, 203] },
    ClassLabel { name: "cake", color: [221, 160, 221] },
    // 家具与电器
    ClassLabel { name: "chair", color: [176, 48, 96] },
    ClassLabel { name: "couch", color: [95, 158, 160] },
    ClassLabel { name: "potted plant", color: [46, 139, 87] },
    ClassLabel { name: "bed", color: [205, 92, 92] },
    ClassLabel { name: "dining table", color: [205, 133, 63] },
    ClassLabel { name: "toilet", color: [240, 230, 140] },
    ClassLabel { name: "tv", color: [100, 149, 237] },
    ClassLabel { name: "laptop", color: [143, 188, 143] },
    ClassLabel { name: "mouse", color: [216, 191, 216] },
    ClassLabel { name: "remote", color: [255, 250, 205] },
    ClassLabel { name: "keyboard", color: [238, 130, 238] },
    ClassLabel { name: "cell phone", color: [154, 205, 50] },
    ClassLabel { name: "microwave", color: [135, 206, 250] },
    ClassLabel { name: "oven", color: [106, 90, 205] },
    ClassLabel { name: "toaster", color: [255, 99, 71] },
    ClassLabel { name: "sink", color: [119, 136, 153] },
    ClassLabel { name: "refrigerator", color: [173, 255, 47] },
    // 其他
    ClassLabel { name: "book", color: [240, 248, 255] },
    ClassLabel { name: "clock", color: [250, 235, 215] },
    ClassLabel { name: "vase", color: [127, 255, 0] },
    ClassLabel { name: "scissors", color: [64, 224, 208] },
    ClassLabel { name: "teddy bear", color: [216, 191, 216] },
    ClassLabel { name: "hair drier", color: [255, 228, 225] },
    ClassLabel { name: "toothbrush", color: [245, 222, 179] },
];

/// 按类别ID查询COCO标签
pub fn coco_label(class_id: u32) -> ClassLabel {
    COCO_LABELS
        .get(class_id as usize)
        .copied()
        .unwrap_or(UNKNOWN_LABEL)
}
